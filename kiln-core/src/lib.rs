//! kiln Core - Record, Error and Configuration Types
//!
//! Pure data structures shared by every kiln crate. All other crates depend
//! on this. No I/O beyond loading a settings file. Also defines the
//! [`Populate`] seam the engine calls on a miss.

pub mod config;
pub mod error;
pub mod populate;
pub mod record;
pub mod time;

pub use config::{CacheSettings, DEFAULT_POLL_INTERVAL_MS};
pub use error::{CodecError, ConfigError, KilnError, KilnResult, StorageError};
pub use populate::{Populate, PopulateFn};
pub use record::{CacheRecord, FileStat, Payloads, RecordMetadata, StatEntry};
pub use time::{minimum_mtime_for, now_millis, system_time_to_millis, EpochMillis, MTIME_MARGIN_MS};
