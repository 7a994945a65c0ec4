//! Memoized file metadata.
//!
//! The tracker answers "what is this path's modification time" without I/O
//! whenever a trusted entry is cached. Entries are refreshed by change
//! events and dropped wholesale on purge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use kiln_core::{FileStat, KilnError, KilnResult, StatEntry, StorageError};

use crate::notifier::ChangeEvent;

/// Shared stat cache keyed by absolute path.
#[derive(Debug, Default)]
pub struct StatTracker {
    entries: RwLock<HashMap<PathBuf, StatEntry>>,
}

impl StatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the stat for `path`.
    ///
    /// A `Known` entry is returned without touching the filesystem. Anything
    /// else triggers a stat whose result is cached. Stat failures, including
    /// not-found, are returned and never cached.
    pub async fn resolve(&self, path: &Path) -> KilnResult<FileStat> {
        let observed = self.get(path)?;
        if let Some(stat) = observed.and_then(|entry| entry.known()) {
            return Ok(stat);
        }

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| KilnError::from_io(path, e))?;
        let stat = FileStat::from_metadata(&meta).map_err(|e| KilnError::from_io(path, e))?;

        let mut entries = self
            .entries
            .write()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?;
        // An event that landed while the stat was in flight is newer than our result.
        if entries.get(path).copied() == observed {
            entries.insert(path.to_path_buf(), StatEntry::Known(stat));
        }
        Ok(stat)
    }

    /// Apply a change event.
    pub fn apply(&self, event: &ChangeEvent) -> KilnResult<()> {
        let entry = match event {
            ChangeEvent::Changed { stat, .. } => StatEntry::Known(*stat),
            ChangeEvent::Removed { .. } => StatEntry::Absent,
            ChangeEvent::Added { .. } => StatEntry::Unknown,
        };
        tracing::debug!(path = %event.path().display(), ?entry, "Applying change event");
        self.set(event.path(), entry)
    }

    pub fn set(&self, path: &Path, entry: StatEntry) -> KilnResult<()> {
        self.entries
            .write()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
            .insert(path.to_path_buf(), entry);
        Ok(())
    }

    pub fn get(&self, path: &Path) -> KilnResult<Option<StatEntry>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
            .get(path)
            .copied())
    }

    /// Drop every entry.
    pub fn clear(&self) -> KilnResult<()> {
        self.entries
            .write()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
            .clear();
        Ok(())
    }

    pub fn len(&self) -> KilnResult<usize> {
        Ok(self
            .entries
            .read()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
            .len())
    }

    pub fn is_empty(&self) -> KilnResult<bool> {
        Ok(self.len()? == 0)
    }
}
