//! Timestamp utilities

use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Today's UTC date as `YYYY-MM-DD`, the date token used in artifact labels
pub fn today_label() -> String {
    now().format("%Y-%m-%d").to_string()
}

/// Compact UTC timestamp `YYYYMMDDTHHMMSSZ` for file names
pub fn stamp_label() -> String {
    now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Age of a filesystem timestamp relative to `now`
///
/// Timestamps in the future (clock skew between hosts sharing a mount)
/// are treated as age zero rather than an error.
pub fn age_at(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}
