//! The caller-supplied derivation step.

use std::future::Future;

use async_trait::async_trait;

use crate::error::KilnResult;
use crate::record::CacheRecord;

/// Produces a fresh record for a key on a cache miss.
///
/// The returned record must declare every file its payloads were derived
/// from in `metadata.source_paths`. The engine stamps `key` and
/// `minimum_mtime` itself.
#[async_trait]
pub trait Populate: Send + Sync {
    async fn populate(&self, key: &str) -> KilnResult<CacheRecord>;
}

/// [`Populate`] adapter for async closures.
pub struct PopulateFn<F> {
    f: F,
}

impl<F> PopulateFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for PopulateFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopulateFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Populate for PopulateFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = KilnResult<CacheRecord>> + Send + 'static,
{
    async fn populate(&self, key: &str) -> KilnResult<CacheRecord> {
        (self.f)(key.to_string()).await
    }
}
