//! Subject source: the tabular list of storefronts to verify

use std::path::Path;
use tracing::{debug, warn};

use crate::csv;
use crate::error::{Error, Result};
use crate::types::Subject;

const NAME_COLUMNS: &[&str] = &["name", "theme"];
const URL_COLUMNS: &[&str] = &["demo_store_url", "demo_url", "url"];
const PRICE_COLUMN: &str = "price_text";
const POPULARITY_COLUMN: &str = "reviews_total";

/// Load subjects from a CSV file with a header row.
pub fn load_csv(path: &Path) -> Result<Vec<Subject>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::SubjectSource(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_csv(&text)
}

/// Parse subject records. Rows that fail to parse are skipped.
pub fn parse_csv(text: &str) -> Result<Vec<Subject>> {
    let mut records = csv::split_records(text).into_iter();
    let header = records
        .next()
        .ok_or_else(|| Error::SubjectSource("subject source is empty".to_string()))?;
    let header: Vec<String> = csv::parse_record(header)?
        .into_iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let find = |names: &[&str]| names.iter().find_map(|n| header.iter().position(|h| h == n));
    let name_idx = find(NAME_COLUMNS);
    let url_idx = find(URL_COLUMNS);
    let price_idx = find(&[PRICE_COLUMN]);
    let popularity_idx = find(&[POPULARITY_COLUMN]);

    if name_idx.is_none() {
        return Err(Error::SubjectSource(
            "subject source has no name/theme column".to_string(),
        ));
    }

    let mut subjects = Vec::new();
    for record in records {
        let fields = match csv::parse_record(record) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Skipping malformed subject row: {}", e);
                continue;
            }
        };
        let get = |idx: Option<usize>| {
            idx.and_then(|i| fields.get(i))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        subjects.push(Subject {
            name: get(name_idx),
            entry_url: get(url_idx),
            popularity: get(popularity_idx).parse().unwrap_or(0),
            is_free: get(price_idx).to_lowercase().contains("free"),
        });
    }

    debug!("Loaded {} subject(s)", subjects.len());
    Ok(subjects)
}
