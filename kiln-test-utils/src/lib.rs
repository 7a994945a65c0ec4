//! kiln Test Utilities
//!
//! Shared test infrastructure for the kiln workspace:
//! - Mock populate operations and record stores
//! - Proptest generators for records
//! - Source tree fixtures with controllable modification times
//! - Custom assertions

pub use kiln_core::{
    CacheRecord, ConfigError, FileStat, KilnError, KilnResult, Payloads, Populate,
    RecordMetadata, StorageError,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kiln_storage::RecordStore;

pub use fixtures::{file_stat, set_mtime, source_tree, SourceTree};

// ============================================================================
// MOCK POPULATE
// ============================================================================

/// Populate that "transpiles" `<root>/<key>` and counts its invocations.
///
/// Produces a `transpiledOutput` and a `sourceMap` payload and declares the
/// source file as its only source path.
#[derive(Debug, Clone)]
pub struct CountingPopulate {
    root: PathBuf,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    touch_sources: bool,
}

impl CountingPopulate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::from_millis(10),
            touch_sources: false,
        }
    }

    /// Sleep for `delay` before reading the source.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Bump the source file's mtime to now after reading it, simulating an
    /// edit that lands while populate runs.
    pub fn touching_sources(mut self) -> Self {
        self.touch_sources = true;
        self
    }

    /// Invocations so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn transpiled_output(key: &str) -> String {
        format!("the transpiled output of {key}")
    }

    pub fn source_map(key: &str) -> String {
        format!("the source map of {key}")
    }
}

#[async_trait]
impl Populate for CountingPopulate {
    async fn populate(&self, key: &str) -> KilnResult<CacheRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let path = self.root.join(key);
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| KilnError::from_io(&path, e))?;
        if self.touch_sources {
            set_mtime(&path, SystemTime::now());
        }

        Ok(CacheRecord::with_sources([path])
            .with_payload("transpiledOutput", Self::transpiled_output(key))
            .with_payload("sourceMap", Self::source_map(key))
            .with_meta("sourceLength", source.len()))
    }
}

// ============================================================================
// MOCK STORES
// ============================================================================

/// Record store whose writes always fail and which never holds a record.
#[derive(Debug, Default)]
pub struct FailingStore {
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write attempts so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn read(&self, key: &str) -> KilnResult<Vec<u8>> {
        Err(KilnError::Storage(StorageError::NotFound {
            path: PathBuf::from(key),
        }))
    }

    async fn write(&self, key: &str, _record: &CacheRecord) -> KilnResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(KilnError::from_io(
            Path::new(key),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "disk is read-only"),
        ))
    }

    async fn remove_all(&self) -> KilnResult<()> {
        Ok(())
    }
}

// ============================================================================
// ASYNC HELPERS
// ============================================================================

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest generators for records.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// Keys as a build tool would use them: relative paths.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z0-9_-]{1,12}(/[a-z0-9_.-]{1,12}){0,3}"
    }

    pub fn arb_payload_name() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9]{0,15}"
    }

    /// Payloads with arbitrary bytes, delimiter bytes included.
    pub fn arb_payloads() -> impl Strategy<Value = Payloads> {
        prop::collection::vec(
            (arb_payload_name(), prop::collection::vec(any::<u8>(), 0..512)),
            0..6,
        )
        .prop_map(|entries| entries.into_iter().collect())
    }

    pub fn arb_extra_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            ".{0,32}".prop_map(Value::from),
        ]
    }

    pub fn arb_metadata() -> impl Strategy<Value = RecordMetadata> {
        (
            arb_key(),
            prop::collection::vec("/[a-z0-9_./-]{1,32}", 0..4),
            any::<i64>(),
            prop::collection::btree_map(
                "[a-z][a-zA-Z]{0,10}".prop_filter("reserved field", |name| {
                    !matches!(
                        name.as_str(),
                        "key" | "sourcePaths" | "minimumMtime" | "payloads"
                    )
                }),
                arb_extra_value(),
                0..4,
            ),
        )
            .prop_map(|(key, sources, minimum_mtime, extra)| {
                let mut metadata = RecordMetadata::with_sources(sources);
                metadata.key = key;
                metadata.minimum_mtime = minimum_mtime;
                metadata.extra = extra.into_iter().collect();
                metadata
            })
    }

    pub fn arb_record() -> impl Strategy<Value = CacheRecord> {
        (arb_metadata(), arb_payloads())
            .prop_map(|(metadata, payloads)| CacheRecord::new(metadata, payloads))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Source trees on disk.

    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    /// How far in the past fixture files are dated, so that a populate
    /// started now sees them as unmodified.
    pub const FIXTURE_AGE: Duration = Duration::from_secs(3600);

    /// Set a file's modification time.
    pub fn set_mtime(path: &Path, time: SystemTime) {
        let file = File::options()
            .write(true)
            .open(path)
            .unwrap_or_else(|e| panic!("open {}: {e}", path.display()));
        file.set_modified(time)
            .unwrap_or_else(|e| panic!("set mtime of {}: {e}", path.display()));
    }

    /// Current stat of a file.
    pub fn file_stat(path: &Path) -> FileStat {
        let meta = std::fs::metadata(path)
            .unwrap_or_else(|e| panic!("stat {}: {e}", path.display()));
        FileStat::from_metadata(&meta).unwrap_or_else(|e| panic!("mtime of {}: {e}", path.display()))
    }

    /// A temporary directory of source files.
    #[derive(Debug)]
    pub struct SourceTree {
        dir: TempDir,
    }

    impl SourceTree {
        pub fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}")),
            }
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        pub fn file(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        /// A directory next to the sources for cache files. Not created.
        pub fn cache_dir(&self) -> PathBuf {
            self.dir.path().join(".kiln-cache")
        }

        /// Write a source file dated [`FIXTURE_AGE`] ago.
        pub fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.file(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .unwrap_or_else(|e| panic!("mkdir {}: {e}", parent.display()));
            }
            std::fs::write(&path, contents)
                .unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
            set_mtime(&path, SystemTime::now() - FIXTURE_AGE);
            path
        }

        /// Bump a source file's mtime to now and return its new stat.
        pub fn touch(&self, name: &str) -> FileStat {
            let path = self.file(name);
            set_mtime(&path, SystemTime::now());
            file_stat(&path)
        }

        pub fn remove(&self, name: &str) {
            let path = self.file(name);
            std::fs::remove_file(&path)
                .unwrap_or_else(|e| panic!("remove {}: {e}", path.display()));
        }
    }

    impl Default for SourceTree {
        fn default() -> Self {
            Self::new()
        }
    }

    /// A source tree containing `names`, each holding `source of <name>`.
    pub fn source_tree(names: &[&str]) -> SourceTree {
        let tree = SourceTree::new();
        for name in names {
            tree.write(name, &format!("source of {name}"));
        }
        tree
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for kiln results.

    use super::*;

    /// Assert that a result is a not-found storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &KilnResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    /// Assert that a result is a Config error naming `field`.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &KilnResult<T>, field: &str) {
        match result {
            Err(KilnError::Config(ConfigError::MissingRequired { field: f }))
            | Err(KilnError::Config(ConfigError::InvalidValue { field: f, .. }))
                if f == field => {}
            other => panic!("Expected Config error for {field}, got: {:?}", other),
        }
    }

    /// Assert that a result is the destructed error.
    #[track_caller]
    pub fn assert_destructed<T: std::fmt::Debug>(result: &KilnResult<T>) {
        match result {
            Err(KilnError::Destructed) => {}
            other => panic!("Expected Destructed error, got: {:?}", other),
        }
    }

    /// Assert that a record carries the payloads [`CountingPopulate`] makes.
    #[track_caller]
    pub fn assert_transpiled(record: &CacheRecord, key: &str) {
        assert_eq!(record.key(), key);
        assert_eq!(
            record.payloads.get_str("transpiledOutput"),
            Some(CountingPopulate::transpiled_output(key).as_str())
        );
        assert_eq!(
            record.payloads.get_str("sourceMap"),
            Some(CountingPopulate::source_map(key).as_str())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counting_populate() {
        let tree = source_tree(&["a.txt"]);
        let populate = CountingPopulate::new(tree.path()).with_delay(Duration::ZERO);

        let record = populate.populate("a.txt").await.unwrap();
        assert_eq!(record.source_paths(), &[tree.file("a.txt")]);
        assert_eq!(
            record.payloads.get_str("sourceMap"),
            Some("the source map of a.txt")
        );
        assert_eq!(populate.calls(), 1);

        assertions::assert_not_found(&populate.populate("nope.txt").await);
        assert_eq!(populate.calls(), 2);
    }

    #[test]
    fn test_fixture_files_are_dated_in_the_past() {
        let tree = source_tree(&["nested/a.txt"]);
        let stat = file_stat(&tree.file("nested/a.txt"));
        let now = kiln_core::now_millis();
        assert!(stat.mtime_ms < now - 60_000);

        let touched = tree.touch("nested/a.txt");
        assert!(touched.mtime_ms > stat.mtime_ms);
    }
}
