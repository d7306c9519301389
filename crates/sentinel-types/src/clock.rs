//! Second-resolution UTC wall clock.
//!
//! Storage and wire timestamps carry whole seconds only. Truncation happens
//! at write time, never at read time.

use chrono::{DateTime, Utc};

/// Current UTC time, truncated to whole seconds.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Truncate an arbitrary timestamp to second resolution.
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}
