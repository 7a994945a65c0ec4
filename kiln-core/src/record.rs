//! Cache record types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::time::system_time_to_millis;

// ============================================================================
// METADATA
// ============================================================================

/// Record metadata: the three engine-managed fields plus arbitrary
/// caller-defined fields flattened beside them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// Cache key. Stamped by the engine after populate returns.
    #[serde(default)]
    pub key: String,

    /// Absolute paths this record's validity depends on. Set by populate.
    #[serde(default)]
    pub source_paths: Vec<PathBuf>,

    /// Epoch milliseconds. The record is valid only while every source
    /// path's modification time is strictly below this value.
    #[serde(default)]
    pub minimum_mtime: i64,

    /// Caller-defined metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordMetadata {
    /// Metadata depending on the given source paths.
    pub fn with_sources<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            source_paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Get a caller-defined field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.extra.get(field)
    }

    /// Set a caller-defined field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(field.into(), value.into());
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Named binary payloads in insertion order.
///
/// Order is not significant for lookups but is what the codec uses to lay
/// out the blob region, so it survives a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payloads {
    entries: Vec<(String, Vec<u8>)>,
}

impl Payloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a payload, returning the previous bytes.
    /// A replaced payload keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        let name = name.into();
        let bytes = bytes.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => Some(std::mem::replace(existing, bytes)),
            None => {
                self.entries.push((name, bytes));
                None
            }
        }
    }

    /// Insert a text payload as UTF-8 bytes.
    pub fn insert_text(&mut self, name: impl Into<String>, text: &str) -> Option<Vec<u8>> {
        self.insert(name, text.as_bytes().to_vec())
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.as_slice())
    }

    /// Get a payload as UTF-8 text, if present and valid.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, b)| (n.as_str(), b.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload size in bytes.
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|(_, b)| b.len()).sum()
    }
}

impl<N, B> FromIterator<(N, B)> for Payloads
where
    N: Into<String>,
    B: Into<Vec<u8>>,
{
    fn from_iter<T: IntoIterator<Item = (N, B)>>(iter: T) -> Self {
        let mut payloads = Payloads::new();
        for (name, bytes) in iter {
            payloads.insert(name, bytes);
        }
        payloads
    }
}

// ============================================================================
// CACHE RECORD
// ============================================================================

/// The unit of caching: metadata plus named payloads.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheRecord {
    pub metadata: RecordMetadata,
    pub payloads: Payloads,
}

impl CacheRecord {
    pub fn new(metadata: RecordMetadata, payloads: Payloads) -> Self {
        Self { metadata, payloads }
    }

    /// Record depending on the given source paths, with no payloads yet.
    pub fn with_sources<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::new(RecordMetadata::with_sources(paths), Payloads::new())
    }

    /// Builder-style payload insertion.
    pub fn with_payload(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.payloads.insert(name, bytes);
        self
    }

    /// Builder-style caller metadata.
    pub fn with_meta(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.set(field, value);
        self
    }

    pub fn key(&self) -> &str {
        &self.metadata.key
    }

    pub fn minimum_mtime(&self) -> i64 {
        self.metadata.minimum_mtime
    }

    pub fn source_paths(&self) -> &[PathBuf] {
        &self.metadata.source_paths
    }
}

// ============================================================================
// FILE STATS
// ============================================================================

/// The subset of filesystem metadata freshness depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Modification time in epoch milliseconds.
    pub mtime_ms: i64,
    /// File length in bytes.
    pub len: u64,
}

impl FileStat {
    pub fn new(mtime_ms: i64, len: u64) -> Self {
        Self { mtime_ms, len }
    }

    /// Extract from `std::fs::Metadata`.
    pub fn from_metadata(meta: &std::fs::Metadata) -> std::io::Result<Self> {
        let modified = meta.modified()?;
        Ok(Self {
            mtime_ms: system_time_to_millis(modified),
            len: meta.len(),
        })
    }
}

/// Memoized stat state for one absolute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEntry {
    /// A stat result that can be trusted without I/O.
    Known(FileStat),
    /// The path was reported removed.
    Absent,
    /// The path was reported added; its metadata must be re-read.
    Unknown,
}

impl StatEntry {
    /// The cached stat, if it can be used without I/O.
    pub fn known(&self) -> Option<FileStat> {
        match self {
            Self::Known(stat) => Some(*stat),
            Self::Absent | Self::Unknown => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payloads_keep_insertion_order() {
        let mut p = Payloads::new();
        p.insert_text("transpiledOutput", "out");
        p.insert_text("sourceMap", "map");
        p.insert_text("a", "first alphabetically");
        let names: Vec<_> = p.names().collect();
        assert_eq!(names, vec!["transpiledOutput", "sourceMap", "a"]);
    }

    #[test]
    fn test_payloads_replace_keeps_position() {
        let mut p: Payloads = [("x", b"1".to_vec()), ("y", b"2".to_vec())]
            .into_iter()
            .collect();
        let old = p.insert("x", b"3".to_vec());
        assert_eq!(old, Some(b"1".to_vec()));
        assert_eq!(p.names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(p.get("x"), Some(&b"3"[..]));
        assert_eq!(p.total_bytes(), 2);
    }

    #[test]
    fn test_payloads_remove_and_text() {
        let mut p = Payloads::new();
        p.insert_text("t", "hello");
        p.insert("bin", vec![0xff, 0x00]);
        assert_eq!(p.get_str("t"), Some("hello"));
        assert_eq!(p.get_str("bin"), None);
        assert_eq!(p.remove("t"), Some(b"hello".to_vec()));
        assert_eq!(p.len(), 1);
        assert!(p.remove("t").is_none());
    }

    #[test]
    fn test_metadata_serializes_camel_case_and_flattens_extra() {
        let mut meta = RecordMetadata::with_sources(["/src/foo.txt"]);
        meta.key = "foo".to_string();
        meta.minimum_mtime = 42;
        meta.set("compileTime", 7);

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            value,
            json!({
                "key": "foo",
                "sourcePaths": ["/src/foo.txt"],
                "minimumMtime": 42,
                "compileTime": 7
            })
        );

        let back: RecordMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_metadata_defaults_missing_engine_fields() {
        let meta: RecordMetadata = serde_json::from_str(r#"{"custom":true}"#).unwrap();
        assert!(meta.key.is_empty());
        assert!(meta.source_paths.is_empty());
        assert_eq!(meta.minimum_mtime, 0);
        assert_eq!(meta.get("custom"), Some(&json!(true)));
    }

    #[test]
    fn test_record_builder() {
        let record = CacheRecord::with_sources(["/a", "/b"])
            .with_payload("out", "x")
            .with_meta("compileTime", 3);
        assert_eq!(record.source_paths().len(), 2);
        assert_eq!(record.payloads.get_str("out"), Some("x"));
        assert_eq!(record.metadata.get("compileTime"), Some(&json!(3)));
        assert_eq!(record.minimum_mtime(), 0);
    }

    #[test]
    fn test_stat_entry_known() {
        let stat = FileStat::new(1_000, 5);
        assert_eq!(StatEntry::Known(stat).known(), Some(stat));
        assert_eq!(StatEntry::Absent.known(), None);
        assert_eq!(StatEntry::Unknown.known(), None);
        assert!(StatEntry::Absent.is_absent());
    }

    #[test]
    fn test_file_stat_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "12345").unwrap();
        let stat = FileStat::from_metadata(&std::fs::metadata(&path).unwrap()).unwrap();
        assert_eq!(stat.len, 5);
        assert!(stat.mtime_ms > 0);
    }
}
