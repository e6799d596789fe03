//! Strict `YYYY-MM-DD` date parsing.
//!
//! Only four-digit year, two-digit month and two-digit day separated by `-`
//! are accepted, and the result must be a real calendar date. Nothing is
//! reinterpreted: `02/01/2024`, `2024-2-1`, or `2024-02-30` all fail.

use crate::error::{Error, Result};
use chrono::NaiveDate;

/// Parse a date in strict `YYYY-MM-DD` form.
///
/// `field` names the value in the resulting `Error::ValidationError`.
///
/// ```
/// use llm_cache_kit::dates::parse_date;
///
/// assert!(parse_date("due_date", "2024-02-01").is_ok());
/// assert!(parse_date("due_date", "02/01/2024").is_err());
/// ```
pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    if !has_iso_shape(value) {
        return Err(Error::validation(
            field,
            format!("'{}' is not in YYYY-MM-DD format", value),
        ));
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| Error::validation(field, format!("'{}' is not a calendar date: {}", value, e)))
}

fn has_iso_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}
