//! Import-line parsing
//!
//! One credential per line: `refresh_token----access_token----timestamp`.
//! The timestamp field must be present but may be empty; it is kept verbatim
//! and never interpreted.

use common::Secret;

use crate::error::{Error, Result};

/// Field separator used by import lines.
pub const FIELD_DELIMITER: &str = "----";

const FIELD_COUNT: usize = 3;

/// A parsed, not yet stored, import line.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub refresh_token: Secret<String>,
    pub access_token: Secret<String>,
    pub timestamp: Option<String>,
}

/// Parse a single import line.
///
/// Rejects lines with the wrong field count and lines whose refresh or access
/// token is empty after trimming.
pub fn parse_line(line: &str) -> Result<ImportRecord> {
    let fields: Vec<&str> = line.trim().split(FIELD_DELIMITER).map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(Error::Malformed(format!(
            "expected {FIELD_COUNT} fields separated by '{FIELD_DELIMITER}', found {}",
            fields.len()
        )));
    }

    let (refresh, access, timestamp) = (fields[0], fields[1], fields[2]);
    if refresh.is_empty() {
        return Err(Error::Malformed("refresh token is empty".into()));
    }
    if access.is_empty() {
        return Err(Error::Malformed("access token is empty".into()));
    }

    Ok(ImportRecord {
        refresh_token: Secret::new(refresh.to_owned()),
        access_token: Secret::new(access.to_owned()),
        timestamp: (!timestamp.is_empty()).then(|| timestamp.to_owned()),
    })
}

/// Parse a batch of lines, skipping blank ones.
///
/// Each entry carries the 1-based line number so rejections can be reported
/// back to the operator. A malformed line never aborts the batch.
pub fn parse_lines<'a, I>(lines: I) -> Vec<(usize, Result<ImportRecord>)>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx + 1, parse_line(line)))
        .collect()
}
