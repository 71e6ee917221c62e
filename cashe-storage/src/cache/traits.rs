//! Versioned store trait and cache statistics.
//!
//! This module defines the compare-and-swap storage contract that every
//! backing store implements, and the counters the cache manager reports.

use async_trait::async_trait;
use cashe_core::{CasWrite, CasheResult, Payload, VersionedEntry, Watermark};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Versioned compare-and-swap store.
///
/// Every logical key owns a value slot and a version slot. Each method runs
/// as a single atomic unit against the backing store: no caller observes a
/// key half-way through one call. Implementations must never retry
/// internally and must never return partial results.
///
/// # Versioning rules
///
/// - `put` accepts a key's write when the key has no version slot, or when
///   the writer's baseline equals the stored version. Accepted overwrites
///   advance the version by one.
/// - `invalidate` drops the value slot and advances the version. Any `put`
///   holding a baseline from before the invalidation fails.
/// - `delete` drops both slots.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Read entries for `keys`, one per key, in input order.
    async fn get(&self, keys: &[String]) -> CasheResult<Vec<VersionedEntry<Payload>>>;

    /// Apply CAS writes. Returns the keys whose write lost its race.
    async fn put(&self, writes: &BTreeMap<String, CasWrite<Payload>>) -> CasheResult<Vec<String>>;

    /// Drop value slots and advance version slots.
    async fn invalidate(&self, keys: &[String]) -> CasheResult<()>;

    /// Drop value and version slots.
    async fn delete(&self, keys: &[String]) -> CasheResult<()>;

    /// Persist a refresh watermark under `name`.
    async fn save_timestamp(&self, name: &str, watermark: Watermark) -> CasheResult<()>;

    /// Read the watermark under `name`, or [`Watermark::zero`] if absent.
    async fn get_timestamp(&self, name: &str) -> CasheResult<Watermark>;
}

#[async_trait]
impl<S> VersionedStore for Arc<S>
where
    S: VersionedStore + ?Sized,
{
    async fn get(&self, keys: &[String]) -> CasheResult<Vec<VersionedEntry<Payload>>> {
        (**self).get(keys).await
    }

    async fn put(&self, writes: &BTreeMap<String, CasWrite<Payload>>) -> CasheResult<Vec<String>> {
        (**self).put(writes).await
    }

    async fn invalidate(&self, keys: &[String]) -> CasheResult<()> {
        (**self).invalidate(keys).await
    }

    async fn delete(&self, keys: &[String]) -> CasheResult<()> {
        (**self).delete(keys).await
    }

    async fn save_timestamp(&self, name: &str, watermark: Watermark) -> CasheResult<()> {
        (**self).save_timestamp(name, watermark).await
    }

    async fn get_timestamp(&self, name: &str) -> CasheResult<Watermark> {
        (**self).get_timestamp(name).await
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a live entry holding a value.
    pub hits: u64,
    /// Lookups answered from a negative entry.
    pub negative_hits: u64,
    /// Lookups that found no live entry.
    pub misses: u64,
    /// Bulk loads actually executed against the database.
    pub loads: u64,
    /// CAS writes that lost their race.
    pub cas_lost: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0), counting negative hits as hits.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.negative_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
