//! On-disk record store.
//!
//! One file per key directly under the cache directory. Writes go to a
//! uniquely named temporary file first and are then renamed into place, so
//! readers never observe a partially written record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_core::{CacheRecord, KilnError, KilnResult, StorageError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::codec;

/// Byte substituted for path separators in on-disk names.
pub const SEPARATOR_SUBSTITUTE: char = '\u{1d}';

/// Prefix of in-progress temporary files.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Map a cache key to its canonical file name.
///
/// Every path-separator character becomes `0x1D` so keys never create
/// nested directories.
pub fn file_name_for_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if std::path::is_separator(c) {
                SEPARATOR_SUBSTITUTE
            } else {
                c
            }
        })
        .collect()
}

/// Whether `key` maps to a usable file name. Empty, `.` and `..` name the
/// cache directory or its parent.
pub fn is_storable_key(key: &str) -> bool {
    !matches!(file_name_for_key(key).as_str(), "" | "." | "..")
}

/// Inverse of [`file_name_for_key`], using `/` as the separator.
pub fn key_for_file_name(name: &str) -> String {
    name.replace(SEPARATOR_SUBSTITUTE, "/")
}

/// Persistent record storage.
///
/// Implementations must report a missing record as
/// [`kiln_core::StorageError::NotFound`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read the raw bytes stored for `key`.
    async fn read(&self, key: &str) -> KilnResult<Vec<u8>>;

    /// Encode and store `record` under `key`, replacing any previous record.
    async fn write(&self, key: &str, record: &CacheRecord) -> KilnResult<()>;

    /// Delete every stored record.
    async fn remove_all(&self) -> KilnResult<()>;

    /// Whether `key` can be stored at all. The engine neither reads nor
    /// persists keys a store rejects.
    fn accepts_key(&self, _key: &str) -> bool {
        true
    }

    /// Read and decode the record for `key`. `Ok(None)` when absent.
    async fn load(&self, key: &str) -> KilnResult<Option<CacheRecord>> {
        match self.read(key).await {
            Ok(bytes) => Ok(Some(codec::decode(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// [`RecordStore`] backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DiskStore {
    cache_dir: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at `cache_dir`. The directory is created lazily
    /// on first write.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Canonical path of the record for `key`.
    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.cache_dir.join(file_name_for_key(key))
    }

    /// List stored keys, sorted. A missing cache directory has no keys.
    pub async fn keys(&self) -> KilnResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KilnError::from_io(&self.cache_dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KilnError::from_io(&self.cache_dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            keys.push(key_for_file_name(name));
        }
        keys.sort();
        Ok(keys)
    }

    async fn create_temp(&self, path: &Path) -> std::io::Result<fs::File> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
    }

    fn unstorable(&self, key: &str) -> KilnError {
        KilnError::Storage(StorageError::Io {
            path: self.cache_dir.join(file_name_for_key(key)),
            kind: std::io::ErrorKind::InvalidInput,
            reason: format!("key {key:?} has no usable file name"),
        })
    }

    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> KilnResult<()> {
        if !is_storable_key(key) {
            return Err(self.unstorable(key));
        }
        let temp = self
            .cache_dir
            .join(format!("{TEMP_PREFIX}{}", Uuid::now_v7()));

        let mut file = match self.create_temp(&temp).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(cache_dir = %self.cache_dir.display(), "Creating cache dir");
                fs::create_dir_all(&self.cache_dir)
                    .await
                    .map_err(|e| KilnError::from_io(&self.cache_dir, e))?;
                self.create_temp(&temp)
                    .await
                    .map_err(|e| KilnError::from_io(&temp, e))?
            }
            Err(e) => return Err(KilnError::from_io(&temp, e)),
        };

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            discard_temp(&temp).await;
            return Err(KilnError::from_io(&temp, e));
        }

        let target = self.path_for_key(key);
        if let Err(e) = fs::rename(&temp, &target).await {
            discard_temp(&temp).await;
            return Err(KilnError::from_io(&target, e));
        }
        tracing::debug!(key, path = %target.display(), bytes = bytes.len(), "Wrote cache record");
        Ok(())
    }
}

async fn discard_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove temporary record file");
    }
}

#[async_trait]
impl RecordStore for DiskStore {
    async fn read(&self, key: &str) -> KilnResult<Vec<u8>> {
        let path = self.path_for_key(key);
        if !is_storable_key(key) {
            return Err(KilnError::Storage(StorageError::NotFound { path }));
        }
        fs::read(&path)
            .await
            .map_err(|e| KilnError::from_io(&path, e))
    }

    async fn write(&self, key: &str, record: &CacheRecord) -> KilnResult<()> {
        let bytes = codec::encode(record)?;
        self.write_bytes(key, &bytes).await
    }

    async fn remove_all(&self) -> KilnResult<()> {
        match fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KilnError::from_io(&self.cache_dir, e)),
        }
    }

    fn accepts_key(&self, key: &str) -> bool {
        is_storable_key(key)
    }
}
