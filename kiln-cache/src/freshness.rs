//! Freshness checks for cached records.
//!
//! A record is fresh while every declared source path exists and has a
//! modification time strictly below the record's `minimumMtime`. Anything
//! that prevents concluding this, including a failed stat, makes it stale.

use std::path::{Path, PathBuf};

use kiln_core::{CacheRecord, EpochMillis};
use kiln_watch::StatTracker;

/// Why a record is no longer valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// A source path is missing.
    SourceMissing { path: PathBuf },
    /// A source path was modified at or after the record's minimum mtime.
    SourceModified {
        path: PathBuf,
        mtime_ms: EpochMillis,
        minimum_mtime: EpochMillis,
    },
    /// A source path could not be stat'ed.
    StatFailed { path: PathBuf, reason: String },
}

impl StaleReason {
    pub fn path(&self) -> &Path {
        match self {
            Self::SourceMissing { path }
            | Self::SourceModified { path, .. }
            | Self::StatFailed { path, .. } => path,
        }
    }
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceMissing { path } => write!(f, "{} is missing", path.display()),
            Self::SourceModified {
                path,
                mtime_ms,
                minimum_mtime,
            } => write!(
                f,
                "{} modified at {mtime_ms} (record requires < {minimum_mtime})",
                path.display()
            ),
            Self::StatFailed { path, reason } => {
                write!(f, "{} could not be stat'ed: {reason}", path.display())
            }
        }
    }
}

/// Outcome of a freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Check `record` against the current source file metadata.
///
/// Stops at the first stale source path.
pub async fn check_freshness(tracker: &StatTracker, record: &CacheRecord) -> Freshness {
    let minimum_mtime = record.minimum_mtime();
    for path in record.source_paths() {
        let stat = match tracker.resolve(path).await {
            Ok(stat) => stat,
            Err(e) if e.is_not_found() => {
                return Freshness::Stale(StaleReason::SourceMissing { path: path.clone() })
            }
            Err(e) => {
                return Freshness::Stale(StaleReason::StatFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        if stat.mtime_ms >= minimum_mtime {
            return Freshness::Stale(StaleReason::SourceModified {
                path: path.clone(),
                mtime_ms: stat.mtime_ms,
                minimum_mtime,
            });
        }
    }
    Freshness::Fresh
}
