//! Durable, resumable result ledger.
//!
//! The ledger is a CSV file with one header record followed by one record per
//! finished job. Rows are only ever appended during a run; `compact` rewrites
//! the file afterwards so each subject identity appears once, carrying the
//! content of its most recent row. All reads and writes of the file go through
//! this type.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::csv;
use crate::error::{Error, Result};
use crate::types::{
    identity_key, JobResult, RunMode, Verdict, ERROR_COLUMN, LEDGER_COLUMNS, NAME_COLUMN,
    VERDICT_COLUMN,
};

/// Append-only outcome log shared by all workers.
pub struct Ledger {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

/// What a compaction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CompactionStats {
    pub rows_before: usize,
    pub rows_after: usize,
}

/// Verdict counts over the ledger's rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Tally {
    pub total: usize,
    pub passed: usize,
    pub no_pass: usize,
    /// Rows written without a verdict (crashed jobs); count as NO-PASS
    pub unjudged: usize,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header record for a fresh ledger.
    pub fn header() -> String {
        csv::join_record(LEDGER_COLUMNS)
    }

    /// Prepare the file for appends.
    ///
    /// Fresh mode, a missing file or an empty file gets truncated and a new
    /// header; otherwise prior rows are kept and new rows are appended. A last
    /// line cut short by a crash is terminated first so the next row starts on
    /// its own line.
    pub fn initialize(&self, mode: &RunMode) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let has_rows = fs::metadata(&self.path).map(|m| m.len() > 0).unwrap_or(false);
        if mode.truncates() || !has_rows {
            let mut file = File::create(&self.path)?;
            writeln!(file, "{}", Self::header())?;
            info!("Ledger initialized at {} ({})", self.path.display(), mode);
        } else {
            info!("Appending to existing ledger {} ({})", self.path.display(), mode);
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        if !ends_with_newline(&self.path)? {
            warn!("Ledger {} ends mid-row, terminating it", self.path.display());
            file.write_all(b"\n")?;
        }
        *self.writer.lock() = Some(file);
        Ok(())
    }

    /// Identity keys of every prior row.
    pub fn load_completed_keys(&self) -> Result<HashSet<String>> {
        let rows = self.read_rows()?;
        Ok(rows
            .iter()
            .filter_map(|fields| fields.get(NAME_COLUMN))
            .filter(|name| !name.is_empty())
            .map(|name| identity_key(name))
            .collect())
    }

    /// Identity keys whose most recent row's error field contains `error_substring`.
    pub fn load_retry_keys(&self, error_substring: &str) -> Result<HashSet<String>> {
        let mut last_error: HashMap<String, String> = HashMap::new();
        for fields in self.read_rows()? {
            let Some(name) = fields.get(NAME_COLUMN).filter(|n| !n.is_empty()) else {
                continue;
            };
            let error = fields.get(ERROR_COLUMN).cloned().unwrap_or_default();
            last_error.insert(identity_key(name), error);
        }

        Ok(last_error
            .into_iter()
            .filter(|(_, error)| !error.is_empty() && error.contains(error_substring))
            .map(|(key, _)| key)
            .collect())
    }

    /// Write one row. Safe to call from many workers at once.
    pub fn append(&self, row: &JobResult) -> Result<()> {
        let mut line = csv::join_record(row.to_fields());
        line.push('\n');

        let mut guard = self.writer.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| Error::Ledger("ledger not initialized".to_string()))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        debug!("Ledger row written for '{}'", row.name);
        Ok(())
    }

    /// Deduplicate by identity, keeping the last row for each key.
    ///
    /// Output order follows the first appearance of each key. Running it on
    /// an already compact ledger leaves the file unchanged.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut guard = self.writer.lock();
        if let Some(file) = guard.as_mut() {
            file.flush()?;
        }
        let reopen = guard.take().is_some();

        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CompactionStats::default())
            }
            Err(e) => return Err(e.into()),
        };

        let (header, records) = split_header(&text);
        let mut order: Vec<(String, &str)> = Vec::new();
        let mut slot: HashMap<String, usize> = HashMap::new();

        for &record in &records {
            let Some(name) = csv::first_field(record) else {
                continue;
            };
            let key = identity_key(&name);
            match slot.get(&key) {
                Some(&idx) => order[idx].1 = record,
                None => {
                    slot.insert(key.clone(), order.len());
                    order.push((key, record));
                }
            }
        }

        let header = header.map(str::to_string).unwrap_or_else(Self::header);
        let mut out = String::with_capacity(text.len());
        out.push_str(&header);
        out.push('\n');
        for (_, record) in &order {
            out.push_str(record);
            out.push('\n');
        }

        let tmp = self.path.with_extension("csv.tmp");
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, &self.path)?;

        if reopen {
            *guard = Some(OpenOptions::new().append(true).open(&self.path)?);
        }

        let stats = CompactionStats {
            rows_before: records.len(),
            rows_after: order.len(),
        };
        info!(
            "Ledger compacted: {} row(s) -> {} row(s)",
            stats.rows_before, stats.rows_after
        );
        Ok(stats)
    }

    /// Count verdicts across the current rows.
    pub fn tally(&self) -> Result<Tally> {
        let mut tally = Tally::default();
        for fields in self.read_rows()? {
            tally.total += 1;
            match fields.get(VERDICT_COLUMN).and_then(|v| Verdict::parse(v)) {
                Some(Verdict::Pass) => tally.passed += 1,
                Some(Verdict::NoPass) => tally.no_pass += 1,
                None => tally.unjudged += 1,
            }
        }
        Ok(tally)
    }

    /// Parse every data row, skipping malformed ones.
    pub fn read_rows(&self) -> Result<Vec<Vec<String>>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (_, records) = split_header(&text);
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            match csv::parse_record(record) {
                Ok(fields) => rows.push(fields),
                Err(e) => warn!("Skipping malformed ledger row: {}", e),
            }
        }
        Ok(rows)
    }
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Separate the header record (first record whose identity field is `name`).
fn split_header(text: &str) -> (Option<&str>, Vec<&str>) {
    let mut records = csv::split_records(text);
    let is_header = records
        .first()
        .and_then(|r| csv::first_field(r))
        .map(|f| f == LEDGER_COLUMNS[NAME_COLUMN])
        .unwrap_or(false);

    if is_header {
        let header = records.remove(0);
        (Some(header), records)
    } else {
        (None, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Subject;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn row(name: &str, verdict: Option<Verdict>, error: &str) -> JobResult {
        let mut row = JobResult::for_subject(&Subject::new(name, format!("https://{}.example", name)));
        row.verdict = verdict;
        row.push_reason(error);
        row
    }

    fn ledger_in(dir: &TempDir) -> Ledger {
        Ledger::new(dir.path().join("out").join("results.csv"))
    }

    #[test]
    fn test_fresh_truncates_and_writes_header() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("dawn", Some(Verdict::Pass), "")).unwrap();

        let again = ledger_in(&dir);
        again.initialize(&RunMode::Fresh).unwrap();
        let text = fs::read_to_string(again.path()).unwrap();
        assert_eq!(text, format!("{}\n", Ledger::header()));
    }

    #[test]
    fn test_resume_appends_and_loads_completed() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("Dawn", Some(Verdict::Pass), "")).unwrap();
        ledger.append(&row("Sense", None, "no_add_button")).unwrap();

        let resumed = ledger_in(&dir);
        resumed.initialize(&RunMode::Resume).unwrap();
        resumed.append(&row("Craft", Some(Verdict::NoPass), "base_no_change")).unwrap();

        let keys = resumed.load_completed_keys().unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("dawn"));
        assert!(keys.contains("craft"));
    }

    #[test]
    fn test_retry_keys_use_last_error() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("dawn", None, "no_add_button")).unwrap();
        ledger.append(&row("dawn", Some(Verdict::Pass), "")).unwrap();
        ledger.append(&row("Sense", None, "alert_dialog;no_add_button")).unwrap();
        ledger.append(&row("craft", None, "No_Add_Button")).unwrap();

        let keys = ledger.load_retry_keys("no_add_button").unwrap();
        assert_eq!(keys, HashSet::from(["sense".to_string()]));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("dawn", None, "boom")).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(ledger.path()).unwrap();
            writeln!(f, "\"bro\"ken,1,2").unwrap();
        }
        ledger.append(&row("sense", None, "boom")).unwrap();

        let keys = ledger.load_retry_keys("boom").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(ledger.read_rows().unwrap().len(), 2);
    }

    fn append_raw(ledger: &Ledger, raw: &str) {
        let mut f = OpenOptions::new().append(true).open(ledger.path()).unwrap();
        f.write_all(raw.as_bytes()).unwrap();
    }

    #[test]
    fn test_stray_quote_skips_only_its_row() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("a", Some(Verdict::Pass), "")).unwrap();
        append_raw(&ledger, "broken,he said \"hi,1,2\n");
        ledger.append(&row("b", None, "timeout")).unwrap();
        ledger.append(&row("c", None, "timeout")).unwrap();
        ledger.append(&row("a", Some(Verdict::Pass), "")).unwrap();

        let completed = ledger.load_completed_keys().unwrap();
        assert_eq!(
            completed,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(
            ledger.load_retry_keys("timeout").unwrap(),
            HashSet::from(["b".to_string(), "c".to_string()])
        );

        ledger.compact().unwrap();
        let text = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("a,")).count(), 1);
        let names: Vec<_> = ledger
            .read_rows()
            .unwrap()
            .into_iter()
            .map(|r| r[NAME_COLUMN].clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_truncated_last_row_is_isolated_on_resume() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("a", None, "timeout")).unwrap();
        append_raw(&ledger, "cut,\"https://cut.example");

        let resumed = ledger_in(&dir);
        resumed.initialize(&RunMode::Resume).unwrap();
        resumed.append(&row("b", None, "timeout")).unwrap();

        let rows = resumed.read_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][NAME_COLUMN], "b");
        assert_eq!(
            resumed.load_retry_keys("timeout").unwrap(),
            HashSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_compact_keeps_last_content_in_first_seen_order() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("a", None, "first")).unwrap();
        ledger.append(&row("b", Some(Verdict::Pass), "")).unwrap();
        ledger.append(&row("A", Some(Verdict::NoPass), "second")).unwrap();

        let stats = ledger.compact().unwrap();
        assert_eq!(stats, CompactionStats { rows_before: 3, rows_after: 2 });

        let rows = ledger.read_rows().unwrap();
        assert_eq!(rows[0][NAME_COLUMN], "A");
        assert_eq!(rows[0][ERROR_COLUMN], "second");
        assert_eq!(rows[1][NAME_COLUMN], "b");
    }

    #[test]
    fn test_compact_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        for (name, err) in [("x", "1"), ("y, z", "2"), ("x", "3"), ("\"q\"", "4"), ("y, z", "5")] {
            ledger.append(&row(name, None, err)).unwrap();
        }

        ledger.compact().unwrap();
        let once = fs::read_to_string(ledger.path()).unwrap();
        ledger.compact().unwrap();
        let twice = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(ledger.read_rows().unwrap().len(), 3);
    }

    #[test]
    fn test_append_after_compact_still_works() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("a", None, "")).unwrap();
        ledger.compact().unwrap();
        ledger.append(&row("b", None, "")).unwrap();
        assert_eq!(ledger.read_rows().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(ledger_in(&dir));
        ledger.initialize(&RunMode::Fresh).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let reason = format!("thread {t}, row {i}\nwith \"quotes\"");
                        ledger.append(&row(&format!("s{t}-{i}"), None, &reason)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let rows = ledger.read_rows().unwrap();
        assert_eq!(rows.len(), 400);
        assert!(rows.iter().all(|r| r.len() == LEDGER_COLUMNS.len()));
    }

    #[test]
    fn test_tally_counts_unjudged_rows() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.initialize(&RunMode::Fresh).unwrap();
        ledger.append(&row("a", Some(Verdict::Pass), "")).unwrap();
        ledger.append(&row("b", Some(Verdict::NoPass), "base_no_change")).unwrap();
        ledger.append(&row("c", None, "timeout")).unwrap();
        let tally = ledger.tally().unwrap();
        assert_eq!(tally, Tally { total: 3, passed: 1, no_pass: 1, unjudged: 1 });
    }

    #[test]
    fn test_missing_ledger_loads_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        assert!(ledger.load_completed_keys().unwrap().is_empty());
        assert!(ledger.load_retry_keys("x").unwrap().is_empty());
        assert_eq!(ledger.compact().unwrap(), CompactionStats::default());
    }
}
