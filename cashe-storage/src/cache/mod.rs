//! Versioned cache layer.
//!
//! This module provides the versioned compare-and-swap store contract, its
//! backends, in-process request coalescing and the cache manager built on
//! top of them.
//!
//! # Design Philosophy
//!
//! Caches that populate themselves after reading the database race with
//! writers: a slow reader can put back a value a writer has already replaced.
//! Instead of locking, every key carries a version. Readers and writers
//! remember the version they saw before going to the database and write back
//! with a compare-and-swap against it. Invalidation bumps the version, which
//! fences out every write that started before it.
//!
//! # Backends
//!
//! - [`InMemoryVersionedStore`]: one process, one mutex
//! - [`LmdbVersionedStore`]: one LMDB write transaction per call
//! - [`RedisVersionedStore`]: Lua scripts, atomic on the Redis server
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(RedisVersionedStore::connect(&RedisConfig::from_env()?)?);
//! let manager = CacheManager::new(store, Arc::new(books), CacheConfig::from_env()?)?;
//!
//! // Misses load once per distinct id set, then populate the cache
//! let found = manager.get_by_ids(&[1, 2, 3]).await?;
//!
//! // Writes go to the database first, then race into the cache
//! manager.update_by_ids(&changes).await?;
//! ```

pub mod coalesce;
pub mod database;
pub mod lmdb_backend;
pub mod manager;
pub mod memory_backend;
pub mod redis_backend;
pub mod traits;

pub use coalesce::{CoalesceMetrics, Coalescer};
pub use database::Database;
pub use lmdb_backend::{LmdbConfig, LmdbStoreError, LmdbVersionedStore};
pub use manager::{CacheManager, LoadCoalescer, LoadKey, RefreshReport};
pub use memory_backend::InMemoryVersionedStore;
pub use redis_backend::{RedisConfig, RedisStoreError, RedisVersionedStore};
pub use traits::{CacheStats, VersionedStore};
