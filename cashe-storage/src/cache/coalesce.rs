//! Request coalescing for concurrent loads of the same key.
//!
//! When several tasks ask for the same key at once, only the first (the
//! leader) runs the load; the others (joiners) wait and receive a clone of
//! the leader's result, error included. The in-flight entry is removed as
//! soon as the leader finishes, so a later call for the same key runs a
//! fresh load rather than replaying a stale result.
//!
//! The in-flight map is split across 16 shards, each behind its own mutex.
//! Locks are only held for map lookups and never across an `.await`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use cashe_core::{CasheResult, CoalesceError};
use tokio::sync::watch;

/// Number of independent shards for the in-flight map.
const NUM_SHARDS: usize = 16;

type Shard<K, V> = Mutex<HashMap<K, watch::Receiver<Option<CasheResult<V>>>>>;

/// Snapshot of coalescing metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalesceMetrics {
    /// Calls that ran the load themselves.
    pub leader_count: u64,
    /// Calls that received a leader's result.
    pub joined_count: u64,
    /// Leader loads that returned an error.
    pub leader_failed_count: u64,
    /// Joiners whose leader was dropped before producing a result.
    pub abandoned_count: u64,
}

enum Role<V> {
    Leader(watch::Sender<Option<CasheResult<V>>>),
    Joiner(watch::Receiver<Option<CasheResult<V>>>),
}

/// Removes the leader's in-flight entry, on completion or cancellation.
struct InflightGuard<'a, K: Hash + Eq, V> {
    shard: &'a Shard<K, V>,
    key: &'a K,
}

impl<K: Hash + Eq, V> Drop for InflightGuard<'_, K, V> {
    fn drop(&mut self) {
        self.shard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}

/// Deduplicates concurrent async loads by key.
pub struct Coalescer<K, V> {
    shards: [Shard<K, V>; NUM_SHARDS],
    leader_count: AtomicU64,
    joined_count: AtomicU64,
    leader_failed_count: AtomicU64,
    abandoned_count: AtomicU64,
}

impl<K, V> Default for Coalescer<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            leader_count: AtomicU64::new(0),
            joined_count: AtomicU64::new(0),
            leader_failed_count: AtomicU64::new(0),
            abandoned_count: AtomicU64::new(0),
        }
    }

    fn shard_index(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    /// Run `load` for `key`, or join the load already in flight for it.
    ///
    /// Joiners get a clone of the leader's result. If the leader is dropped
    /// before finishing, joiners fail with [`CoalesceError::LeaderAbandoned`].
    pub async fn call<F, Fut>(&self, key: K, load: F) -> CasheResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CasheResult<V>>,
    {
        let shard = &self.shards[Self::shard_index(&key)];

        let role = {
            let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(&key) {
                Some(receiver) => Role::Joiner(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    map.insert(key.clone(), receiver);
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Joiner(mut receiver) => {
                let shared = receiver
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|state| (*state).clone());
                match shared {
                    Some(result) => {
                        self.joined_count.fetch_add(1, Ordering::Relaxed);
                        result
                    }
                    None => {
                        self.abandoned_count.fetch_add(1, Ordering::Relaxed);
                        Err(CoalesceError::LeaderAbandoned {
                            key: format!("{key:?}"),
                        }
                        .into())
                    }
                }
            }
            Role::Leader(sender) => {
                self.leader_count.fetch_add(1, Ordering::Relaxed);
                let guard = InflightGuard { shard, key: &key };
                let result = load().await;
                drop(guard);

                if result.is_err() {
                    self.leader_failed_count.fetch_add(1, Ordering::Relaxed);
                }
                sender.send_replace(Some(result.clone()));
                result
            }
        }
    }

    /// Number of loads currently in flight (sum across all shards).
    pub fn inflight_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn metrics(&self) -> CoalesceMetrics {
        CoalesceMetrics {
            leader_count: self.leader_count.load(Ordering::Relaxed),
            joined_count: self.joined_count.load(Ordering::Relaxed),
            leader_failed_count: self.leader_failed_count.load(Ordering::Relaxed),
            abandoned_count: self.abandoned_count.load(Ordering::Relaxed),
        }
    }
}
