//! Timestamp and pagination cursor codecs.
//!
//! `indexed_at` values are stored as RFC 3339 UTC strings with exactly three
//! fractional digits, so lexical order in SQLite equals time order. Feed
//! cursors are the same instant expressed as epoch milliseconds.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Latest representable instant, `9999-12-31T23:59:59.999Z`.
///
/// Later years render with a sign and five digits and break lexical order.
pub const MAX_INDEXED_AT_MILLIS: i64 = 253_402_300_799_999;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format epoch milliseconds as an `indexed_at` string.
pub fn format_indexed_at(millis: i64) -> Result<String> {
    if millis > MAX_INDEXED_AT_MILLIS {
        return Err(Error::InvalidTimestamp(millis.to_string()));
    }
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| Error::InvalidTimestamp(millis.to_string()))
}

/// Parse an `indexed_at` string back to epoch milliseconds.
pub fn parse_indexed_at(value: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| Error::InvalidTimestamp(value.to_string()))
}

/// Turn the last row's `indexed_at` into the cursor handed to clients.
pub fn encode_cursor(indexed_at: &str) -> Result<String> {
    parse_indexed_at(indexed_at).map(|millis| millis.to_string())
}

/// Turn a client cursor into the `indexed_at` bound for the next page.
///
/// Only non-negative decimal integers are accepted.
pub fn decode_cursor(cursor: &str) -> Result<String> {
    let invalid = || Error::InvalidCursor(cursor.to_string());

    if cursor.is_empty() || !cursor.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let millis: i64 = cursor.parse().map_err(|_| invalid())?;
    format_indexed_at(millis).map_err(|_| invalid())
}
