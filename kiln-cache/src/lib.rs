//! kiln Cache - Freshness-Checked Build Artifact Cache
//!
//! [`ArtifactCache`] returns the payloads derived from a set of source files,
//! recomputing them only when a source file has been modified since the
//! cached copy was produced.
//!
//! ```ignore
//! let cache = ArtifactCache::builder()
//!     .cache_dir("/var/cache/my-transpiler")
//!     .populate_fn(|key: String| async move {
//!         let source = tokio::fs::read_to_string(&key)
//!             .await
//!             .map_err(|e| KilnError::from_io(Path::new(&key), e))?;
//!         Ok(CacheRecord::with_sources([key.as_str()])
//!             .with_payload("transpiledOutput", transpile(&source)))
//!     })
//!     .build()?;
//!
//! let record = cache.read("/project/src/app.ts").await?;
//! ```

pub mod engine;
pub mod freshness;
pub mod stats;

pub use engine::{ArtifactCache, ArtifactCacheBuilder};
pub use freshness::{check_freshness, Freshness, StaleReason};
pub use stats::{CacheMetrics, CacheStats};

pub use kiln_core::{
    CacheRecord, CacheSettings, KilnError, KilnResult, Payloads, Populate, PopulateFn,
    RecordMetadata,
};
pub use kiln_storage::{DiskStore, RecordStore};
pub use kiln_watch::{ChangeEvent, ChangeNotifier, ManualNotifier, PollingNotifier, StatTracker};
