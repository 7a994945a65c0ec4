//! Change notification.
//!
//! A [`ChangeNotifier`] watches a growing set of source paths and publishes
//! [`ChangeEvent`]s on a broadcast channel. Delivery is best-effort. Events
//! for one path arrive in the order they occurred; there is no ordering
//! across paths.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use kiln_core::{FileStat, KilnError, KilnResult, StorageError};
use tokio::sync::broadcast;

/// Buffered events per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A filesystem change for one watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The file was modified; `stat` is its new metadata.
    Changed { path: PathBuf, stat: FileStat },
    /// The file was deleted.
    Removed { path: PathBuf },
    /// The file appeared. Carries no metadata; consumers must re-stat.
    Added { path: PathBuf },
}

impl ChangeEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Changed { path, .. } | Self::Removed { path } | Self::Added { path } => path,
        }
    }
}

/// Filesystem-watch capability.
pub trait ChangeNotifier: Send + Sync {
    /// Start watching `paths`. Already-watched paths are ignored, and paths
    /// that do not exist yet are accepted.
    fn watch(&self, paths: &[PathBuf]) -> KilnResult<()>;

    /// Receive every event published from now on.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Currently watched paths, sorted.
    fn watched(&self) -> KilnResult<Vec<PathBuf>>;

    /// Stop publishing. Subscribers observe a closed channel. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Broadcast sender that can be closed from a shared reference.
#[derive(Debug)]
pub(crate) struct EventHub {
    sender: RwLock<Option<broadcast::Sender<ChangeEvent>>>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    /// Publish an event, returning how many subscribers received it.
    pub(crate) fn send(&self, event: ChangeEvent) -> usize {
        match self.sender.read() {
            Ok(guard) => guard
                .as_ref()
                .and_then(|sender| sender.send(event).ok())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        if let Ok(guard) = self.sender.read() {
            if let Some(sender) = guard.as_ref() {
                return sender.subscribe();
            }
        }
        // Closed: hand out a receiver whose sender is already gone.
        broadcast::channel(1).1
    }

    pub(crate) fn close(&self) {
        match self.sender.write() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.read().map(|g| g.is_none()).unwrap_or(true)
    }
}

/// Notifier driven by the embedding application.
///
/// Useful when the host already has a file watcher, and in tests.
#[derive(Debug)]
pub struct ManualNotifier {
    hub: EventHub,
    watched: RwLock<BTreeSet<PathBuf>>,
}

impl Default for ManualNotifier {
    fn default() -> Self {
        Self {
            hub: EventHub::new(),
            watched: RwLock::new(BTreeSet::new()),
        }
    }
}

impl ManualNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `event` to every subscriber. Returns the number of receivers;
    /// zero after [`ChangeNotifier::close`].
    pub fn emit(&self, event: ChangeEvent) -> usize {
        self.hub.send(event)
    }

    /// Whether `path` has been registered through [`ChangeNotifier::watch`].
    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched
            .read()
            .map(|w| w.contains(path))
            .unwrap_or(false)
    }
}

impl ChangeNotifier for ManualNotifier {
    fn watch(&self, paths: &[PathBuf]) -> KilnResult<()> {
        let mut watched = self
            .watched
            .write()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?;
        watched.extend(paths.iter().cloned());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.hub.subscribe()
    }

    fn watched(&self) -> KilnResult<Vec<PathBuf>> {
        Ok(self
            .watched
            .read()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
            .iter()
            .cloned()
            .collect())
    }

    fn close(&self) {
        self.hub.close();
    }

    fn is_closed(&self) -> bool {
        self.hub.is_closed()
    }
}
