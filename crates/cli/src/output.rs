//! Output formatting for CLI

use cartcheck_e2e::runner::RunSummary;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

/// Print a success message
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print the end-of-run summary table.
pub fn print_summary(summary: &RunSummary) {
    let tally = &summary.tally;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![Cell::new("Mode"), Cell::new(&summary.mode)]);
    if let Some(filter) = &summary.name_filter {
        table.add_row(vec![Cell::new("Filter"), Cell::new(filter)]);
    }
    table.add_row(vec![Cell::new("Scheduled"), Cell::new(summary.scheduled)]);
    table.add_row(vec![Cell::new("Concurrency"), Cell::new(summary.concurrency)]);
    table.add_row(vec![Cell::new("Ledger rows"), Cell::new(tally.total)]);
    table.add_row(vec![Cell::new("PASS"), Cell::new(tally.passed)]);
    table.add_row(vec![Cell::new("NO-PASS"), Cell::new(tally.no_pass)]);
    table.add_row(vec![Cell::new("No verdict"), Cell::new(tally.unjudged)]);
    table.add_row(vec![
        Cell::new("Duration"),
        Cell::new(format!("{:.1}s", summary.duration_ms as f64 / 1000.0)),
    ]);
    table.add_row(vec![
        Cell::new("Ledger"),
        Cell::new(summary.ledger.display().to_string()),
    ]);

    println!();
    println!("{}", " Cart Refresh Verification".bold());
    println!("{table}");

    if tally.total > 0 && tally.passed == tally.total {
        println!("{} every subject passed", "✓".green().bold());
    } else if tally.total > 0 {
        println!(
            "{} {} of {} subject(s) did not pass",
            "✗".red().bold(),
            tally.total - tally.passed,
            tally.total
        );
    }
}
