//! Worklist construction: priority ordering plus run-mode filtering

use std::collections::HashSet;
use tracing::info;

use crate::error::Result;
use crate::ledger::Ledger;
use crate::types::{RunMode, Subject};

/// Prior-state filter resolved from the ledger for a run mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Run everything
    All,
    /// Skip these keys
    Exclude(HashSet<String>),
    /// Run only these keys
    Only(HashSet<String>),
}

impl Selection {
    /// Read whatever prior state `mode` needs from the ledger.
    pub fn resolve(mode: &RunMode, ledger: &Ledger) -> Result<Self> {
        Ok(match mode {
            RunMode::Fresh => Selection::All,
            RunMode::Resume => {
                let done = ledger.load_completed_keys()?;
                info!("[RESUME] {} subject(s) already recorded", done.len());
                Selection::Exclude(done)
            }
            RunMode::Fix(err) => {
                let retry = ledger.load_retry_keys(err)?;
                info!("[FIX] Mode enabled for error=\"{}\", retrying {} subject(s)", err, retry.len());
                Selection::Only(retry)
            }
        })
    }

    fn admits(&self, key: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Exclude(keys) => !keys.contains(key),
            Selection::Only(keys) => keys.contains(key),
        }
    }
}

/// Order subjects by priority: free tier first, then popularity descending.
///
/// The sort is stable, so ties keep their source order.
pub fn prioritize(subjects: &mut [Subject]) {
    subjects.sort_by(|a, b| {
        b.is_free
            .cmp(&a.is_free)
            .then_with(|| b.popularity.cmp(&a.popularity))
    });
}

/// Apply ordering, the mode selection and the optional name filter.
pub fn filter(subjects: Vec<Subject>, selection: &Selection, name_filter: Option<&str>) -> Vec<Subject> {
    let needle = name_filter
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty());

    let mut work: Vec<Subject> = subjects
        .into_iter()
        .filter(|s| {
            let key = s.key();
            if let Some(needle) = &needle {
                if !key.contains(needle.as_str()) {
                    return false;
                }
            }
            selection.admits(&key)
        })
        .collect();
    prioritize(&mut work);
    work
}

/// Build the ordered worklist for a run.
pub fn build(
    subjects: Vec<Subject>,
    mode: &RunMode,
    ledger: &Ledger,
    name_filter: Option<&str>,
) -> Result<Vec<Subject>> {
    let selection = Selection::resolve(mode, ledger)?;
    Ok(filter(subjects, &selection, name_filter))
}
