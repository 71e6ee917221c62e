//! CASHE Storage - Versioned Stores, Coalescing and the Cache Manager
//!
//! Defines the versioned CAS store abstraction and its backends, the
//! database collaborator trait, and the cache manager that ties them
//! together. A mock database is provided for tests and examples.

pub mod cache;

pub use cache::{
    CacheManager, CacheStats, CoalesceMetrics, Coalescer, Database, InMemoryVersionedStore,
    LmdbConfig, LmdbStoreError, LmdbVersionedStore, LoadCoalescer, LoadKey, RedisConfig, RedisStoreError,
    RedisVersionedStore, RefreshReport, VersionedStore,
};

use async_trait::async_trait;
use cashe_core::{CacheId, CacheableEntity, CasheResult, DatabaseError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

// ============================================================================
// MOCK DATABASE
// ============================================================================

/// One row of the mock database. Deleted rows keep a tombstone so that
/// update-window queries still report them.
#[derive(Debug, Clone)]
struct MockRecord<T> {
    entity: Option<T>,
    updated_at: DateTime<Utc>,
}

/// In-memory [`Database`] for testing.
///
/// Every mutation stamps the record with the current time, so
/// `ids_updated_between` and `updated_between` behave like an `updated_at`
/// column query.
#[derive(Debug)]
pub struct MockDatabase<I, T> {
    entity: String,
    records: RwLock<HashMap<I, MockRecord<T>>>,
    load_calls: AtomicUsize,
    load_delay: Option<Duration>,
    failing: AtomicBool,
}

impl<I, T> MockDatabase<I, T>
where
    I: CacheId,
    T: CacheableEntity,
{
    /// Create an empty mock database for `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            records: RwLock::new(HashMap::new()),
            load_calls: AtomicUsize::new(0),
            load_delay: None,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every `load` sleep before answering.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Insert or replace a record.
    pub fn insert(&self, id: I, entity: T) {
        self.stamp(id, Some(entity));
    }

    /// Delete a record, leaving a tombstone.
    pub fn remove(&self, id: &I) {
        self.stamp(id.clone(), None);
    }

    /// Current record for `id`.
    pub fn get(&self, id: &I) -> Option<T> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(|record| record.entity.clone())
    }

    /// Number of `load` calls received.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Make `load` fail until switched off again.
    pub fn fail_loads(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn stamp(&self, id: I, entity: Option<T>) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                MockRecord {
                    entity,
                    updated_at: Utc::now(),
                },
            );
    }

    fn changed_in(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(I, Option<T>)> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, record)| start < record.updated_at && record.updated_at <= end)
            .map(|(id, record)| (id.clone(), record.entity.clone()))
            .collect()
    }
}

#[async_trait]
impl<I, T> Database for MockDatabase<I, T>
where
    I: CacheId,
    T: CacheableEntity,
{
    type Id = I;
    type Entity = T;

    fn entity_name(&self) -> &str {
        &self.entity
    }

    async fn load(&self, ids: &[I]) -> CasheResult<HashMap<I, T>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatabaseError::LoadFailed {
                entity: self.entity.clone(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids
            .iter()
            .filter_map(|id| {
                let entity = records.get(id)?.entity.clone()?;
                Some((id.clone(), entity))
            })
            .collect())
    }

    async fn update(&self, changes: &HashMap<I, Option<T>>) -> CasheResult<()> {
        for (id, entity) in changes {
            self.stamp(id.clone(), entity.clone());
        }
        Ok(())
    }

    async fn ids_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CasheResult<Vec<I>> {
        Ok(self
            .changed_in(start, end)
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    async fn updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CasheResult<HashMap<I, T>> {
        Ok(self
            .changed_in(start, end)
            .into_iter()
            .filter_map(|(id, entity)| Some((id, entity?)))
            .collect())
    }
}
