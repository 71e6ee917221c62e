//! The authoritative record store behind the cache.

use std::collections::HashMap;

use async_trait::async_trait;
use cashe_core::{CacheId, CacheableEntity, CasheResult};
use chrono::{DateTime, Utc};

/// Database collaborator for one entity type.
///
/// The cache never writes entities anywhere but through [`Database::update`],
/// and never trusts its own copy over what these methods return.
#[async_trait]
pub trait Database: Send + Sync {
    type Id: CacheId;
    type Entity: CacheableEntity;

    /// Entity type name, used as the middle segment of cache keys.
    fn entity_name(&self) -> &str;

    /// Fetch records by primary key. Ids without a record are omitted.
    async fn load(&self, ids: &[Self::Id]) -> CasheResult<HashMap<Self::Id, Self::Entity>>;

    /// Write changes through. `None` deletes the record.
    async fn update(&self, changes: &HashMap<Self::Id, Option<Self::Entity>>) -> CasheResult<()>;

    /// Ids of records changed in `(start, end]`, deletions included.
    async fn ids_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CasheResult<Vec<Self::Id>>;

    /// Records changed in `(start, end]` that still exist.
    async fn updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CasheResult<HashMap<Self::Id, Self::Entity>>;
}
