//! cartcheck CLI - Main Entry Point
//!
//! Verifies, storefront by storefront, that a cart refresh routine leaves
//! the page looking exactly like the storefront's own add-to-cart flow.

use anyhow::Context;
use cartcheck_common::config::RunConfig;
use cartcheck_common::types::RunMode;
use cartcheck_e2e::playwright::PlaywrightBridge;
use cartcheck_e2e::runner::BatchRunner;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

mod output;

/// cartcheck - visual cart refresh verification
#[derive(Parser, Debug)]
#[command(name = "cartcheck")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Only run subjects whose name contains this text (case-insensitive)
    filter: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long, default_value = "cartcheck.toml", env = "CARTCHECK_CONFIG")]
    config: PathBuf,

    /// Subject source CSV
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory for screenshots, diffs, ledger and summary
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Number of subjects verified concurrently
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Prebuilt in-page refresh bundle
    #[arg(long)]
    refresh_script: Option<PathBuf>,

    /// Keep the existing ledger and skip subjects that already have a row
    #[arg(long)]
    resume: bool,

    /// Keep the existing ledger and re-run subjects whose last error contains ERR
    #[arg(long, value_name = "ERR")]
    fix: Option<String>,

    /// Headed browser; contexts stay open for inspection
    #[arg(long)]
    debug: bool,

    /// With --debug, keep each finished page open and its worker busy until
    /// the page is closed by hand
    #[arg(long, requires = "debug")]
    hold: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Write the effective configuration to the --config path and exit
    #[arg(long)]
    write_config: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn run_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = RunConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(input) = &self.input {
            config.input_csv = input.clone();
        }
        if let Some(out) = &self.out {
            config.out_dir = out.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(script) = &self.refresh_script {
            config.refresh_script = script.clone();
        }
        if self.debug {
            config.headless = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let config = cli.run_config()?;

    if cli.write_config {
        config
            .save(&cli.config)
            .with_context(|| format!("writing {}", cli.config.display()))?;
        output::print_success(&format!("Configuration written to {}", cli.config.display()));
        return Ok(());
    }

    let mode = RunMode::from_flags(cli.resume, cli.fix.as_deref());

    PlaywrightBridge::check_playwright_installed()?;

    info!(
        "cartcheck v{}: input={} out={} mode={}",
        env!("CARGO_PKG_VERSION"),
        config.input_csv.display(),
        config.out_dir.display(),
        mode
    );

    let runner = BatchRunner::new(config)
        .with_mode(mode)
        .with_name_filter(cli.filter.clone())
        .with_debug(cli.debug)
        .with_hold(cli.hold);

    let summary = runner.run().await.context("run aborted during startup")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        output::print_summary(&summary);
    }

    Ok(())
}
