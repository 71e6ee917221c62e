//! Read-through / write-through cache manager.
//!
//! The manager composes a [`VersionedStore`], a [`Database`] and a
//! [`Coalescer`]. It never locks: every write into the store is a CAS against
//! the version observed before the database was consulted, and every write
//! that loses its race is either dropped (reads) or fenced by invalidation
//! (updates and refresh), so the cache never keeps a value older than one a
//! concurrent writer established.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cashe_core::{
    from_payload, to_payload, CacheConfig, CasWrite, CasheResult, KeyScheme, Lookup, Payload,
    RefreshLoad, RefreshWindow, StoreError, Version, VersionedEntry, Watermark,
};

use super::coalesce::{CoalesceMetrics, Coalescer};
use super::database::Database;
use super::traits::{CacheStats, VersionedStore};

/// In-flight key of a miss load: the manager's key layout plus the exact
/// set of ids the read is missing.
pub type LoadKey<I> = (KeyScheme, BTreeSet<I>);

/// Coalescer for miss loads, shareable between managers.
///
/// Loads only join when both the key layout and the missing id set match,
/// so managers over different entity types or prefixes never share results.
pub type LoadCoalescer<D> = Coalescer<
    LoadKey<<D as Database>::Id>,
    Arc<HashMap<<D as Database>::Id, <D as Database>::Entity>>,
>;

/// Outcome of one scheduled refresh pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport<I> {
    /// Update window the pass covered.
    pub window: RefreshWindow,
    /// Distinct ids the database reported as updated in the window.
    pub ids_updated: usize,
    /// Ids whose fresh value (or negative entry) was written.
    pub ids_written: usize,
    /// Ids whose CAS lost and were invalidated instead.
    pub ids_invalidated: Vec<I>,
}

/// Versioned read-through / write-through cache for one entity type.
///
/// # Type Parameters
///
/// - `S`: The versioned store holding cached entries
/// - `D`: The authoritative database for the entity type
///
/// # Example
///
/// ```ignore
/// let manager = CacheManager::with_defaults(Arc::new(store), Arc::new(books))?;
///
/// let found = manager.get_by_ids(&[1, 2]).await?;
/// manager.update_by_ids(&HashMap::from([(2, Some(book))])).await?;
///
/// // Called periodically by the embedding service
/// let report = manager.scheduled_invalidate_updated().await?;
/// ```
pub struct CacheManager<S, D>
where
    S: VersionedStore,
    D: Database,
{
    store: Arc<S>,
    database: Arc<D>,
    keys: KeyScheme,
    config: CacheConfig,
    coalescer: Arc<LoadCoalescer<D>>,
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    cas_lost: AtomicU64,
}

impl<S, D> CacheManager<S, D>
where
    S: VersionedStore,
    D: Database,
{
    /// Create a manager with its own coalescer.
    pub fn new(store: Arc<S>, database: Arc<D>, config: CacheConfig) -> CasheResult<Self> {
        Self::with_coalescer(store, database, config, Arc::new(Coalescer::new()))
    }

    /// Create a manager with default configuration.
    pub fn with_defaults(store: Arc<S>, database: Arc<D>) -> CasheResult<Self> {
        Self::new(store, database, CacheConfig::default())
    }

    /// Create a manager sharing an in-flight table with other managers.
    pub fn with_coalescer(
        store: Arc<S>,
        database: Arc<D>,
        config: CacheConfig,
        coalescer: Arc<LoadCoalescer<D>>,
    ) -> CasheResult<Self> {
        config.validate()?;
        let keys = KeyScheme::new(config.key_prefix.clone(), database.entity_name());
        Ok(Self {
            store,
            database,
            keys,
            config,
            coalescer,
            hits: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            cas_lost: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn database(&self) -> &D {
        &self.database
    }

    /// Value slot of `id`.
    pub fn compose_key(&self, id: &D::Id) -> String {
        self.keys.compose(id)
    }

    /// Watermark slot of this entity type.
    pub fn watermark_key(&self) -> String {
        self.keys.watermark_key()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            cas_lost: self.cas_lost.load(Ordering::Relaxed),
        }
    }

    pub fn coalesce_metrics(&self) -> CoalesceMetrics {
        self.coalescer.metrics()
    }

    /// Read entities, loading misses from the database.
    ///
    /// The result is aligned with `ids`; `None` means the entity does not
    /// exist. Misses are loaded once per distinct missing id set across all
    /// concurrent callers, then written back as CAS writes against the
    /// version observed here. Ids the database does not return are cached as
    /// negative entries.
    pub async fn get_by_ids(&self, ids: &[D::Id]) -> CasheResult<Vec<Option<D::Entity>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found: HashMap<D::Id, Option<D::Entity>> = HashMap::with_capacity(ids.len());
        let mut missing: BTreeMap<D::Id, Option<Version>> = BTreeMap::new();

        for (id, entry) in self.observe(ids).await? {
            match entry.lookup {
                Lookup::Hit(Some(payload)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(id, Some(from_payload(payload)?));
                }
                Lookup::Hit(None) => {
                    self.negative_hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(id, None);
                }
                Lookup::Miss => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    missing.insert(id, entry.version);
                }
            }
        }

        if !missing.is_empty() {
            let loaded = self.load_coalesced(missing.keys().cloned().collect()).await?;

            let writes = self.cas_writes(&missing, |id| loaded.get(id))?;
            let lost = self.store.put(&writes).await?;
            if !lost.is_empty() {
                self.cas_lost.fetch_add(lost.len() as u64, Ordering::Relaxed);
                tracing::debug!(
                    entity = self.keys.entity(),
                    lost = lost.len(),
                    "Skipped read-through writes that lost their race"
                );
            }

            for id in missing.into_keys() {
                let entity = loaded.get(&id).cloned();
                found.insert(id, entity);
            }
        }

        Ok(ids
            .iter()
            .map(|id| found.get(id).cloned().flatten())
            .collect())
    }

    /// Write changes through to the database, then into the cache.
    ///
    /// `None` deletes the record in the database and caches a negative
    /// entry. Keys whose CAS loses to a concurrent writer are invalidated.
    pub async fn update_by_ids(
        &self,
        changes: &HashMap<D::Id, Option<D::Entity>>,
    ) -> CasheResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let ids: Vec<D::Id> = changes.keys().cloned().collect();
        let baselines = self.baselines(&ids).await?;
        self.database.update(changes).await?;

        let writes = self.cas_writes(&baselines, |id| changes.get(id).and_then(Option::as_ref))?;
        let lost = self.write_or_fence(&writes).await?;
        if !lost.is_empty() {
            tracing::debug!(
                entity = self.keys.entity(),
                invalidated = lost.len(),
                "Invalidated keys after losing update race"
            );
        }
        Ok(())
    }

    /// Cache negative entries for `ids` without touching the database.
    pub async fn set_nulls(&self, ids: &[D::Id]) -> CasheResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let baselines = self.baselines(ids).await?;
        let writes = self.cas_writes(&baselines, |_| None)?;
        self.write_or_fence(&writes).await?;
        Ok(())
    }

    /// Remove both slots of every id. The database is not touched.
    pub async fn delete(&self, ids: &[D::Id]) -> CasheResult<()> {
        self.store.delete(&self.keys.compose_all(ids)).await
    }

    /// Fence `ids`: drop their values and advance their versions, so any
    /// in-flight write holding an older baseline loses.
    pub async fn invalidate(&self, ids: &[D::Id]) -> CasheResult<()> {
        self.store.invalidate(&self.keys.compose_all(ids)).await
    }

    /// Apply database updates made since the last pass.
    ///
    /// Reads the watermark, asks the database for ids updated in
    /// `(watermark, now]`, CAS-writes their fresh state against the versions
    /// observed before loading, invalidates the keys whose CAS lost, and
    /// advances the watermark to `now`. Ids that no longer have a record are
    /// cached as negative entries.
    pub async fn scheduled_invalidate_updated(&self) -> CasheResult<RefreshReport<D::Id>> {
        let watermark_key = self.keys.watermark_key();
        let last = self.store.get_timestamp(&watermark_key).await?;
        let now = Watermark::now().max(last);
        let window = RefreshWindow::new(last, now);

        let ids: Vec<D::Id> = self
            .database
            .ids_updated_between(window.start.at(), window.end.at())
            .await?
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut report = RefreshReport {
            window,
            ids_updated: ids.len(),
            ids_written: 0,
            ids_invalidated: Vec::new(),
        };

        if !ids.is_empty() {
            let baselines = self.baselines(&ids).await?;

            self.loads.fetch_add(1, Ordering::Relaxed);
            let fresh = match self.config.refresh_load {
                RefreshLoad::UpdatedBetween => {
                    self.database
                        .updated_between(window.start.at(), window.end.at())
                        .await?
                }
                RefreshLoad::ByIds => self.database.load(&ids).await?,
            };

            let writes = self.cas_writes(&baselines, |id| fresh.get(id))?;
            let lost: BTreeSet<String> = self.write_or_fence(&writes).await?.into_iter().collect();

            report.ids_invalidated = ids
                .iter()
                .filter(|id| lost.contains(&self.keys.compose(*id)))
                .cloned()
                .collect();
            report.ids_written = ids.len() - report.ids_invalidated.len();

            if !lost.is_empty() {
                tracing::warn!(
                    entity = self.keys.entity(),
                    invalidated = lost.len(),
                    "Refresh lost CAS races, keys invalidated"
                );
            }
        }

        self.store.save_timestamp(&watermark_key, now).await?;

        tracing::info!(
            entity = self.keys.entity(),
            from_millis = window.start.as_millis(),
            to_millis = window.end.as_millis(),
            updated = report.ids_updated,
            written = report.ids_written,
            "Refreshed updated entities"
        );
        Ok(report)
    }

    /// Read the store entries of `ids`, paired with their ids in input order.
    async fn observe(&self, ids: &[D::Id]) -> CasheResult<Vec<(D::Id, VersionedEntry<Payload>)>> {
        let keys = self.keys.compose_all(ids);
        let entries = self.store.get(&keys).await?;
        if entries.len() != keys.len() {
            return Err(StoreError::MalformedReply {
                script: "get".to_string(),
                reason: format!("expected {} entries, got {}", keys.len(), entries.len()),
            }
            .into());
        }
        Ok(ids.iter().cloned().zip(entries).collect())
    }

    /// Versions currently stored for `ids`, used as CAS baselines.
    async fn baselines(&self, ids: &[D::Id]) -> CasheResult<BTreeMap<D::Id, Option<Version>>> {
        Ok(self
            .observe(ids)
            .await?
            .into_iter()
            .map(|(id, entry)| (id, entry.version))
            .collect())
    }

    async fn load_coalesced(
        &self,
        ids: BTreeSet<D::Id>,
    ) -> CasheResult<Arc<HashMap<D::Id, D::Entity>>> {
        self.coalescer
            .call((self.keys.clone(), ids.clone()), || async {
                self.loads.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    entity = self.keys.entity(),
                    misses = ids.len(),
                    "Loading cache misses"
                );
                let ids: Vec<D::Id> = ids.iter().cloned().collect();
                Ok(Arc::new(self.database.load(&ids).await?))
            })
            .await
    }

    /// CAS writes of `value_of(id)` against each id's baseline.
    fn cas_writes<'v, F>(
        &self,
        baselines: &BTreeMap<D::Id, Option<Version>>,
        value_of: F,
    ) -> CasheResult<BTreeMap<String, CasWrite<Payload>>>
    where
        F: Fn(&D::Id) -> Option<&'v D::Entity>,
        D::Entity: 'v,
    {
        baselines
            .iter()
            .map(|(id, expected)| {
                let value = value_of(id).map(to_payload).transpose()?;
                Ok((self.keys.compose(id), CasWrite::new(*expected, value)))
            })
            .collect()
    }

    /// Apply CAS writes and invalidate every key that lost.
    async fn write_or_fence(
        &self,
        writes: &BTreeMap<String, CasWrite<Payload>>,
    ) -> CasheResult<Vec<String>> {
        let lost = self.store.put(writes).await?;
        if !lost.is_empty() {
            self.cas_lost.fetch_add(lost.len() as u64, Ordering::Relaxed);
            self.store.invalidate(&lost).await?;
        }
        Ok(lost)
    }
}
