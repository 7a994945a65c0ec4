//! Two-tier artifact cache engine.
//!
//! `read(key)` walks memory, then disk, then populate, checking freshness at
//! each tier. Concurrent reads of one key share a single in-flight lookup.
//! Purge is a global barrier: it waits for in-flight lookups and holds back
//! new ones until the cache is empty again.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use kiln_core::{
    minimum_mtime_for, now_millis, CacheRecord, CacheSettings, ConfigError, KilnError,
    KilnResult, Populate, PopulateFn, StorageError,
};
use kiln_storage::{DiskStore, RecordStore};
use kiln_watch::{spawn_listener, ChangeNotifier, PollingNotifier, StatTracker};
use tokio::sync::{watch, OwnedRwLockReadGuard, RwLock as AsyncRwLock};

use crate::freshness::{check_freshness, Freshness, StaleReason};
use crate::stats::{CacheMetrics, CacheStats};

type InFlight = Shared<BoxFuture<'static, KilnResult<Arc<CacheRecord>>>>;

fn poisoned<T>(_: T) -> KilnError {
    KilnError::Storage(StorageError::LockPoisoned)
}

/// Result of consulting one tier.
enum Lookup {
    Hit(Arc<CacheRecord>),
    Stale(StaleReason),
    Missing,
}

struct Inner {
    settings: CacheSettings,
    populate: Arc<dyn Populate>,
    store: Option<Arc<dyn RecordStore>>,
    notifier: Arc<dyn ChangeNotifier>,
    tracker: Arc<StatTracker>,
    memory: RwLock<HashMap<String, Arc<CacheRecord>>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    purge_gate: Arc<AsyncRwLock<()>>,
    destructed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    metrics: CacheMetrics,
}

/// Removes a key's in-flight entry when the owning lookup ends, including
/// by panic.
struct InFlightRelease<'a> {
    inner: &'a Inner,
    key: &'a str,
}

impl Drop for InFlightRelease<'_> {
    fn drop(&mut self) {
        match self.inner.in_flight.lock() {
            Ok(mut in_flight) => {
                in_flight.remove(self.key);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(self.key);
            }
        }
    }
}

impl Inner {
    fn ensure_live(&self) -> KilnResult<()> {
        if self.destructed.load(Ordering::SeqCst) {
            Err(KilnError::Destructed)
        } else {
            Ok(())
        }
    }

    /// Attach to the key's in-flight lookup, or start one.
    ///
    /// The new lookup takes `gate` with it so a purge waits for it to end.
    fn join_or_start(
        self: &Arc<Self>,
        key: &str,
        gate: OwnedRwLockReadGuard<()>,
    ) -> KilnResult<InFlight> {
        let mut in_flight = self.in_flight.lock().map_err(poisoned)?;
        if let Some(existing) = in_flight.get(key) {
            tracing::debug!(key, "Waiting for in-flight lookup");
            return Ok(existing.clone());
        }

        let task = tokio::spawn(Self::run_lookup(self.clone(), key.to_string(), gate));
        let task_key = key.to_string();
        let handle = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(KilnError::populate(
                    task_key,
                    format!("lookup task failed: {e}"),
                )),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(key.to_string(), handle.clone());
        Ok(handle)
    }

    async fn run_lookup(
        self: Arc<Self>,
        key: String,
        gate: OwnedRwLockReadGuard<()>,
    ) -> KilnResult<Arc<CacheRecord>> {
        let _gate = gate;
        let _release = InFlightRelease {
            inner: &self,
            key: &key,
        };

        let record = self.lookup(&key).await?;
        self.memory
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), record.clone());
        Ok(record)
    }

    async fn lookup(&self, key: &str) -> KilnResult<Arc<CacheRecord>> {
        match self.from_memory(key).await? {
            Lookup::Hit(record) => return Ok(record),
            Lookup::Stale(reason) => tracing::debug!(key, %reason, "Memory record stale"),
            Lookup::Missing => {}
        }

        match self.from_disk(key).await? {
            Lookup::Hit(record) => return Ok(record),
            Lookup::Stale(reason) => tracing::debug!(key, %reason, "Disk record stale"),
            Lookup::Missing => tracing::debug!(key, "No usable disk record"),
        }

        self.populate_record(key).await
    }

    async fn from_memory(&self, key: &str) -> KilnResult<Lookup> {
        let cached = self.memory.read().map_err(poisoned)?.get(key).cloned();
        let Some(record) = cached else {
            return Ok(Lookup::Missing);
        };
        match check_freshness(&self.tracker, &record).await {
            Freshness::Fresh => {
                CacheMetrics::incr(&self.metrics.memory_hits);
                Ok(Lookup::Hit(record))
            }
            Freshness::Stale(reason) => Ok(Lookup::Stale(reason)),
        }
    }

    async fn from_disk(&self, key: &str) -> KilnResult<Lookup> {
        let Some(store) = &self.store else {
            return Ok(Lookup::Missing);
        };
        if !store.accepts_key(key) {
            return Ok(Lookup::Missing);
        }
        CacheMetrics::incr(&self.metrics.disk_reads);
        let Some(record) = store.load(key).await? else {
            return Ok(Lookup::Missing);
        };
        // Distinct keys can share a file name after separator substitution.
        if record.key() != key {
            tracing::debug!(key, stored_key = record.key(), "Disk record belongs to another key");
            return Ok(Lookup::Missing);
        }
        match check_freshness(&self.tracker, &record).await {
            Freshness::Fresh => {
                CacheMetrics::incr(&self.metrics.disk_hits);
                tracing::debug!(key, "Loaded fresh record from disk");
                Ok(Lookup::Hit(Arc::new(record)))
            }
            Freshness::Stale(reason) => Ok(Lookup::Stale(reason)),
        }
    }

    async fn populate_record(&self, key: &str) -> KilnResult<Arc<CacheRecord>> {
        let started_at = now_millis();
        CacheMetrics::incr(&self.metrics.populates);
        tracing::debug!(key, "Populating");

        let mut record = self.populate.populate(key).await?;
        record.metadata.minimum_mtime = minimum_mtime_for(started_at);
        record.metadata.key = key.to_string();

        if let Err(e) = self.notifier.watch(record.source_paths()) {
            tracing::warn!(key, error = %e, "Failed to watch source paths");
        }

        if let Some(store) = self.store.as_ref().filter(|store| store.accepts_key(key)) {
            // Sources edited while populate ran make the result stale already.
            match check_freshness(&self.tracker, &record).await {
                Freshness::Fresh => match store.write(key, &record).await {
                    Ok(()) => CacheMetrics::incr(&self.metrics.persisted),
                    Err(e) => {
                        CacheMetrics::incr(&self.metrics.persist_failures);
                        tracing::warn!(key, error = %e, "Failed to persist cache record");
                    }
                },
                Freshness::Stale(reason) => {
                    CacheMetrics::incr(&self.metrics.persist_skipped);
                    tracing::debug!(key, %reason, "Record stale after populate, not persisting");
                }
            }
        }

        Ok(Arc::new(record))
    }

    fn clear_memory(&self) -> KilnResult<()> {
        self.memory.write().map_err(poisoned)?.clear();
        Ok(())
    }
}

/// Freshness-checked, persistent build artifact cache.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("settings", &self.inner.settings)
            .field("destructed", &self.is_destructed())
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    pub fn builder() -> ArtifactCacheBuilder {
        ArtifactCacheBuilder::default()
    }

    /// Build a cache from settings and a populate operation, using the disk
    /// store and polling notifier.
    pub fn new(settings: CacheSettings, populate: impl Populate + 'static) -> KilnResult<Self> {
        Self::builder()
            .settings(settings)
            .populate(populate)
            .build()
    }

    /// Get the record for `key`, populating it if no fresh copy exists.
    ///
    /// Every caller that arrives while a lookup for `key` is running gets
    /// that lookup's result.
    pub async fn read(&self, key: &str) -> KilnResult<Arc<CacheRecord>> {
        self.inner.ensure_live()?;
        let gate = self.inner.purge_gate.clone().read_owned().await;
        self.inner.ensure_live()?;

        let handle = self.inner.join_or_start(key, gate)?;
        handle.await
    }

    /// Delete every cached record in memory and on disk and forget all
    /// tracked stats.
    ///
    /// Waits for in-flight lookups first; reads issued meanwhile wait for the
    /// purge. Individual step failures are logged and skipped.
    pub async fn purge(&self) {
        let _barrier = self.inner.purge_gate.write().await;
        tracing::debug!("Purging cache");

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.remove_all().await {
                tracing::warn!(error = %e, "Failed to remove cache directory");
            }
        }
        if let Err(e) = self.inner.clear_memory() {
            tracing::warn!(error = %e, "Failed to clear memory tier");
        }
        if let Err(e) = self.inner.tracker.clear() {
            tracing::warn!(error = %e, "Failed to clear stat cache");
        }
    }

    /// Stop change notification and reject all future reads. Idempotent.
    pub fn destruct(&self) {
        if self.inner.destructed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.notifier.close();
        tracing::debug!("Cache destructed");
    }

    pub fn is_destructed(&self) -> bool {
        self.inner.destructed.load(Ordering::SeqCst)
    }

    /// Drop the memory-tier record for `key`. Returns whether one existed.
    pub fn evict(&self, key: &str) -> KilnResult<bool> {
        Ok(self
            .inner
            .memory
            .write()
            .map_err(poisoned)?
            .remove(key)
            .is_some())
    }

    pub fn memory_len(&self) -> KilnResult<usize> {
        Ok(self.inner.memory.read().map_err(poisoned)?.len())
    }

    /// Number of keys with a lookup in progress.
    pub fn in_flight(&self) -> KilnResult<usize> {
        Ok(self.inner.in_flight.lock().map_err(poisoned)?.len())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot()
    }

    pub fn stat_tracker(&self) -> &Arc<StatTracker> {
        &self.inner.tracker
    }

    pub fn notifier(&self) -> &Arc<dyn ChangeNotifier> {
        &self.inner.notifier
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }
}

/// Builder for [`ArtifactCache`].
#[derive(Default)]
pub struct ArtifactCacheBuilder {
    settings: CacheSettings,
    populate: Option<Arc<dyn Populate>>,
    store: Option<Arc<dyn RecordStore>>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
}

impl ArtifactCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all settings.
    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.settings.persist = persist;
        self
    }

    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.settings.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings = self.settings.with_poll_interval(interval);
        self
    }

    /// Set the populate operation. Required.
    pub fn populate(mut self, populate: impl Populate + 'static) -> Self {
        self.populate = Some(Arc::new(populate));
        self
    }

    /// Set the populate operation from an async closure.
    pub fn populate_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KilnResult<CacheRecord>> + Send + 'static,
    {
        self.populate(PopulateFn::new(f))
    }

    /// Use a custom record store instead of a [`DiskStore`] on `cache_dir`.
    /// Ignored when persistence is off.
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom change notifier instead of a [`PollingNotifier`].
    pub fn notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the configuration and start the engine.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> KilnResult<ArtifactCache> {
        let populate = self.populate.ok_or_else(|| ConfigError::MissingRequired {
            field: "populate".to_string(),
        })?;
        self.settings.validate()?;
        tokio::runtime::Handle::try_current().map_err(|e| ConfigError::InvalidValue {
            field: "runtime".to_string(),
            value: "none".to_string(),
            reason: e.to_string(),
        })?;

        let store = if self.settings.persist {
            self.store.or_else(|| {
                self.settings
                    .cache_dir
                    .clone()
                    .map(|dir| Arc::new(DiskStore::new(dir)) as Arc<dyn RecordStore>)
            })
        } else {
            None
        };

        let notifier: Arc<dyn ChangeNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(PollingNotifier::spawn(self.settings.poll_interval())?),
        };

        let tracker = Arc::new(StatTracker::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_listener(tracker.clone(), notifier.subscribe(), shutdown_rx);

        tracing::debug!(
            persist = self.settings.persist,
            cache_dir = ?self.settings.cache_dir,
            "Artifact cache ready"
        );

        Ok(ArtifactCache {
            inner: Arc::new(Inner {
                settings: self.settings,
                populate,
                store,
                notifier,
                tracker,
                memory: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                purge_gate: Arc::new(AsyncRwLock::new(())),
                destructed: AtomicBool::new(false),
                shutdown_tx,
                metrics: CacheMetrics::new(),
            }),
        })
    }
}
