//! Minimal RFC 4180 codec shared by the result ledger and the subject source.
//!
//! Records are separated by `\n` outside quoted fields, so a quoted value may
//! span several physical lines. A trailing `\r` on a record is dropped. An
//! unbalanced quote never swallows the records after it.

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Quote a value if it contains a delimiter, a quote or a line break.
pub fn escape(value: &str) -> Cow<'_, str> {
    if value.contains(['"', ',', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Join fields into one record (without the trailing newline).
pub fn join_record<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape(field.as_ref()));
    }
    out
}

/// Split text into raw records, skipping blank ones.
///
/// A record keeps absorbing physical lines while it has an open quote. The
/// joined span is only accepted if it parses to as many fields as the first
/// record. Otherwise just its first line is emitted and splitting restarts on
/// the next line, so a stray quote costs a single record; the caller sees that
/// line fail to parse.
pub fn split_records(text: &str) -> Vec<&str> {
    let lines = line_spans(text);
    let mut records = Vec::new();
    let mut width: Option<usize> = None;
    let mut i = 0;

    while i < lines.len() {
        let (start, first_end) = lines[i];
        let mut quotes = quote_count(&text[start..first_end]);
        let mut j = i;
        while quotes % 2 == 1 && j + 1 < lines.len() {
            j += 1;
            let (s, e) = lines[j];
            quotes += quote_count(&text[s..e]);
        }

        let span = trim_cr(&text[start..lines[j].1]);
        let fields = if quotes % 2 == 0 {
            parse_record(span).ok().map(|f| f.len())
        } else {
            None
        };
        let spans_lines_cleanly = match (fields, width) {
            (Some(n), Some(w)) => n == w,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if j > i && !spans_lines_cleanly {
            push_record(&mut records, &text[start..first_end]);
            i += 1;
        } else {
            if width.is_none() && !span.trim().is_empty() {
                width = fields;
            }
            push_record(&mut records, span);
            i = j + 1;
        }
    }
    records
}

/// `(start, end)` byte offsets of each physical line, newline excluded.
fn line_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            spans.push((start, i));
            start = i + 1;
        }
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

fn quote_count(line: &str) -> usize {
    line.bytes().filter(|&b| b == b'"').count()
}

fn trim_cr(raw: &str) -> &str {
    raw.strip_suffix('\r').unwrap_or(raw)
}

fn push_record<'a>(records: &mut Vec<&'a str>, raw: &'a str) {
    let raw = trim_cr(raw);
    if !raw.trim().is_empty() {
        records.push(raw);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FieldState {
    Start,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

/// Strictly parse one record into its fields.
pub fn parse_record(record: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut state = FieldState::Start;

    for (offset, ch) in record.char_indices() {
        state = match (state, ch) {
            (FieldState::Start, '"') => FieldState::Quoted,
            (FieldState::Start | FieldState::Unquoted | FieldState::QuoteInQuoted, ',') => {
                fields.push(std::mem::take(&mut field));
                FieldState::Start
            }
            (FieldState::Unquoted, '"') => {
                return Err(Error::MalformedRecord {
                    offset,
                    reason: "quote inside unquoted field".to_string(),
                });
            }
            (FieldState::Start | FieldState::Unquoted, c) => {
                field.push(c);
                FieldState::Unquoted
            }
            (FieldState::Quoted, '"') => FieldState::QuoteInQuoted,
            (FieldState::Quoted, c) => {
                field.push(c);
                FieldState::Quoted
            }
            (FieldState::QuoteInQuoted, '"') => {
                field.push('"');
                FieldState::Quoted
            }
            (FieldState::QuoteInQuoted, _) => {
                return Err(Error::MalformedRecord {
                    offset,
                    reason: "unexpected character after closing quote".to_string(),
                });
            }
        };
    }

    if state == FieldState::Quoted {
        return Err(Error::MalformedRecord {
            offset: record.len(),
            reason: "unterminated quoted field".to_string(),
        });
    }
    fields.push(field);
    Ok(fields)
}

/// Leniently extract the first field of a record.
///
/// Handles a quoted first field with doubled quotes; an unterminated quote
/// yields everything after the opening quote. Returns `None` for an empty
/// field.
pub fn first_field(record: &str) -> Option<String> {
    let value = if let Some(rest) = record.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    out.push('"');
                    chars.next();
                    continue;
                }
                break;
            }
            out.push(ch);
        }
        out
    } else {
        match record.find(',') {
            Some(idx) => record[..idx].to_string(),
            None => record.to_string(),
        }
    };

    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
