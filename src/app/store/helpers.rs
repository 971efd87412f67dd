//! Row-to-entity parsing helpers shared by the table modules.

use chrono::{DateTime, Utc};

use crate::app::error::StoreError;

/// Parse a TEXT timestamp; accepts RFC 3339 and SQLite's `datetime('now')`
/// format.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Query(format!("failed to parse datetime '{s}': {e}")))
}

pub fn parse_optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match s {
        Some(s) if !s.is_empty() => Ok(Some(parse_datetime(s)?)),
        _ => Ok(None),
    }
}

/// Nullable TEXT column; SQL NULL and empty string both read as `None`.
pub fn get_opt_string(row: &libsql::Row, idx: i32) -> Result<Option<String>, StoreError> {
    match row.get::<Option<String>>(idx)? {
        Some(s) if s.is_empty() => Ok(None),
        other => Ok(other),
    }
}

/// Parse a stored label with one of the `from_label` constructors.
pub fn parse_label<T>(
    raw: &str,
    what: &str,
    from_label: impl Fn(&str) -> Option<T>,
) -> Result<T, StoreError> {
    from_label(raw).ok_or_else(|| StoreError::Query(format!("unknown {what} '{raw}'")))
}

pub fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Query(format!("invalid JSON in {what}: {e}")))
}

pub fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Query(format!("failed to encode {what}: {e}")))
}

pub fn get_usize(row: &libsql::Row, idx: i32) -> Result<usize, StoreError> {
    let value = row.get::<i64>(idx)?;
    usize::try_from(value)
        .map_err(|_| StoreError::Query(format!("negative count {value} in column {idx}")))
}
