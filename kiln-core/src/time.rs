//! Epoch-millisecond timestamps.

use chrono::{DateTime, Utc};
use std::time::SystemTime;

/// Epoch milliseconds, the unit used for `minimumMtime` and file mtimes.
pub type EpochMillis = i64;

/// Margin subtracted from a populate's start time to obtain its
/// `minimumMtime`. Covers filesystems with whole-second mtime resolution.
pub const MTIME_MARGIN_MS: EpochMillis = 1_000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> EpochMillis {
    Utc::now().timestamp_millis()
}

/// Convert a `SystemTime` (e.g. a file's mtime) to epoch milliseconds.
pub fn system_time_to_millis(time: SystemTime) -> EpochMillis {
    DateTime::<Utc>::from(time).timestamp_millis()
}

/// The `minimumMtime` for a populate that started at `started_at`.
pub fn minimum_mtime_for(started_at: EpochMillis) -> EpochMillis {
    started_at - MTIME_MARGIN_MS
}
