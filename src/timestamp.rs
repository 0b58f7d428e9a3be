//! Ordering keys for Raindrop timestamps.
//!
//! Raindrop reports instants as ISO-8601 strings in UTC (`2024-03-02T09:30:00.000Z`).
//! Notes store them verbatim, so every "is this newer" decision goes through
//! [`compare_key`], which folds an instant into a `YYYYMMDDHHMMSS` integer.
//! Sub-second precision is dropped, so the watermark and highlight
//! timestamps are compared at one-second granularity.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::NoteError;

/// Watermark written into freshly created notes. Older than anything Raindrop can return.
pub const EPOCH_SENTINEL: &str = "2000-01-01T00:00:00.000Z";

pub fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>, NoteError> {
    let trimmed = timestamp.trim();
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| NoteError::Parse {
            value: timestamp.to_string(),
            source,
        })
}

pub fn compare_key(timestamp: &str) -> Result<i64, NoteError> {
    let instant = parse_timestamp(timestamp)?;
    let date = i64::from(instant.year()) * 10_000 + i64::from(instant.month()) * 100
        + i64::from(instant.day());
    let time = i64::from(instant.hour()) * 10_000
        + i64::from(instant.minute()) * 100
        + i64::from(instant.second());
    Ok(date * 1_000_000 + time)
}
