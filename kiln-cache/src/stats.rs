//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by the engine with relaxed ordering.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub memory_hits: AtomicU64,
    pub disk_reads: AtomicU64,
    pub disk_hits: AtomicU64,
    pub populates: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_skipped: AtomicU64,
    pub persist_failures: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            populates: self.populates.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_skipped: self.persist_skipped.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.disk_reads,
            &self.disk_hits,
            &self.populates,
            &self.persisted,
            &self.persist_skipped,
            &self.persist_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of engine counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups answered by a fresh memory-tier record.
    pub memory_hits: u64,
    /// Disk-tier reads attempted.
    pub disk_reads: u64,
    /// Disk-tier reads that produced a fresh record.
    pub disk_hits: u64,
    /// Populate invocations.
    pub populates: u64,
    /// Records written to disk after populate.
    pub persisted: u64,
    /// Writes skipped because the record went stale during populate.
    pub persist_skipped: u64,
    /// Writes that failed and were ignored.
    pub persist_failures: u64,
}

impl CacheStats {
    /// Fraction of lookups served without populating. Zero when idle.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.populates;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
