//! Core data model shared by the ledger, worklist and verification pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// One test target loaded from the subject source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Display name; its lower-cased form is the identity key
    pub name: String,

    /// URL the procedure starts from (may be empty)
    pub entry_url: String,

    /// Secondary ordering score, higher runs earlier
    #[serde(default)]
    pub popularity: u64,

    /// Presentation-tier flag, free subjects run first
    #[serde(default)]
    pub is_free: bool,
}

impl Subject {
    pub fn new(name: impl Into<String>, entry_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_url: entry_url.into(),
            popularity: 0,
            is_free: false,
        }
    }

    /// Case-insensitive identity key used by the ledger.
    pub fn key(&self) -> String {
        identity_key(&self.name)
    }
}

/// Normalize a subject name into its ledger identity key.
pub fn identity_key(name: &str) -> String {
    name.to_lowercase()
}

/// Final judgement for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "NO-PASS")]
    NoPass,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::NoPass => "NO-PASS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "PASS" => Some(Verdict::Pass),
            "NO-PASS" => Some(Verdict::NoPass),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run treats prior ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Truncate the ledger and run everything
    #[default]
    Fresh,
    /// Append, skipping subjects that already have a row
    Resume,
    /// Append, re-running only subjects whose last error contains the substring
    Fix(String),
}

impl RunMode {
    /// Pick the mode from CLI-style switches. Fix wins over resume.
    pub fn from_flags(resume: bool, fix: Option<&str>) -> Self {
        match fix.map(str::trim).filter(|s| !s.is_empty()) {
            Some(err) => RunMode::Fix(err.to_string()),
            None if resume => RunMode::Resume,
            None => RunMode::Fresh,
        }
    }

    pub fn truncates(&self) -> bool {
        matches!(self, RunMode::Fresh)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Fresh => f.write_str("fresh"),
            RunMode::Resume => f.write_str("resume"),
            RunMode::Fix(err) => write!(f, "fix({})", err),
        }
    }
}

/// Ledger column names, in file order.
pub const LEDGER_COLUMNS: [&str; 23] = [
    "name",
    "entry_url",
    "navigated",
    "found_trigger",
    "clicked_trigger",
    "resolved_item",
    "manual_trigger_ok",
    "refresh_ok",
    "settle_after_trigger",
    "settle_after_manual",
    "pre_trigger_png",
    "post_trigger_png",
    "post_refresh_png",
    "base_diff_png",
    "base_change_pct",
    "refresh_diff_png",
    "refresh_change_pct",
    "skipped_no_change",
    "dialog_interrupted",
    "verdict",
    "error",
    "schema_name",
    "schema_id",
];

/// Index of the identity column.
pub const NAME_COLUMN: usize = 0;
/// Index of the verdict column.
pub const VERDICT_COLUMN: usize = 19;
/// Index of the accumulated reason codes column.
pub const ERROR_COLUMN: usize = 20;

/// One outcome row per subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub name: String,
    pub entry_url: String,
    pub navigated: bool,
    pub found_trigger: bool,
    pub clicked_trigger: bool,
    pub resolved_item: bool,
    pub manual_trigger_ok: bool,
    pub refresh_ok: bool,
    pub settle_after_trigger: Option<f64>,
    pub settle_after_manual: Option<f64>,
    pub pre_trigger_png: Option<String>,
    pub post_trigger_png: Option<String>,
    pub post_refresh_png: Option<String>,
    pub base_diff_png: Option<String>,
    pub base_change_pct: Option<f64>,
    pub refresh_diff_png: Option<String>,
    pub refresh_change_pct: Option<f64>,
    pub skipped_no_baseline_change: bool,
    pub dialog_interrupted: bool,
    pub verdict: Option<Verdict>,
    /// Semicolon-joined reason codes
    pub reason_codes: String,
    pub schema_name: String,
    pub schema_id: String,
}

impl JobResult {
    pub fn for_subject(subject: &Subject) -> Self {
        Self {
            name: subject.name.clone(),
            entry_url: subject.entry_url.clone(),
            ..Default::default()
        }
    }

    /// Identity key for this row.
    pub fn key(&self) -> String {
        identity_key(&self.name)
    }

    /// Append a reason fragment; earlier fragments are kept.
    pub fn push_reason(&mut self, code: impl AsRef<str>) {
        let code = code.as_ref();
        if code.is_empty() {
            return;
        }
        if !self.reason_codes.is_empty() {
            self.reason_codes.push(';');
        }
        self.reason_codes.push_str(code);
    }

    pub fn reasons(&self) -> impl Iterator<Item = &str> {
        self.reason_codes.split(';').filter(|s| !s.is_empty())
    }

    pub fn has_reason(&self, prefix: &str) -> bool {
        self.reasons().any(|r| r.starts_with(prefix))
    }

    /// A row without a verdict counts as NO-PASS downstream.
    pub fn effective_verdict(&self) -> Verdict {
        self.verdict.unwrap_or(Verdict::NoPass)
    }

    /// Render the row as ledger fields, in `LEDGER_COLUMNS` order.
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.entry_url.clone(),
            flag(self.navigated),
            flag(self.found_trigger),
            flag(self.clicked_trigger),
            flag(self.resolved_item),
            flag(self.manual_trigger_ok),
            flag(self.refresh_ok),
            number(self.settle_after_trigger),
            number(self.settle_after_manual),
            self.pre_trigger_png.clone().unwrap_or_default(),
            self.post_trigger_png.clone().unwrap_or_default(),
            self.post_refresh_png.clone().unwrap_or_default(),
            self.base_diff_png.clone().unwrap_or_default(),
            number(self.base_change_pct),
            self.refresh_diff_png.clone().unwrap_or_default(),
            number(self.refresh_change_pct),
            flag(self.skipped_no_baseline_change),
            flag(self.dialog_interrupted),
            self.verdict.map(|v| v.as_str().to_string()).unwrap_or_default(),
            self.reason_codes.clone(),
            self.schema_name.clone(),
            self.schema_id.clone(),
        ]
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Round a percentage to four decimals for the ledger.
pub fn round_pct(pct: f64) -> f64 {
    (pct * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_accumulate() {
        let mut row = JobResult::default();
        row.push_reason("alert_dialog");
        row.push_reason("");
        row.push_reason("base_diff_failed:bad png");
        assert_eq!(row.reason_codes, "alert_dialog;base_diff_failed:bad png");
        assert!(row.has_reason("base_diff_failed"));
    }

    #[test]
    fn test_fields_match_columns() {
        let mut row = JobResult::for_subject(&Subject::new("Dawn", "https://dawn.example"));
        row.verdict = Some(Verdict::Pass);
        row.base_change_pct = Some(round_pct(1.234_567));
        let fields = row.to_fields();
        assert_eq!(fields.len(), LEDGER_COLUMNS.len());
        assert_eq!(fields[NAME_COLUMN], "Dawn");
        assert_eq!(fields[VERDICT_COLUMN], "PASS");
        assert_eq!(fields[14], "1.2346");
    }

    #[test]
    fn test_missing_verdict_is_no_pass() {
        let row = JobResult::default();
        assert_eq!(row.effective_verdict(), Verdict::NoPass);
    }

    #[test]
    fn test_run_mode_flags() {
        assert_eq!(RunMode::from_flags(false, None), RunMode::Fresh);
        assert_eq!(RunMode::from_flags(true, None), RunMode::Resume);
        assert_eq!(
            RunMode::from_flags(true, Some("no_add_button")),
            RunMode::Fix("no_add_button".to_string())
        );
        assert_eq!(RunMode::from_flags(false, Some("  ")), RunMode::Fresh);
    }
}
