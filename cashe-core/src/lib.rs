//! CASHE Core - Data Types
//!
//! Pure data structures for the versioned cache: entries, keys, watermarks,
//! slot encoding, configuration and errors. No I/O lives here; the stores and
//! the cache manager are in `cashe-storage`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{Debug, Display};
use std::hash::Hash;

pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod watermark;

pub use codec::{decode_slot, encode_slot};
pub use config::{CacheConfig, RefreshLoad};
pub use entry::{cas_outcome, fenced_version, CasWrite, Lookup, Version, VersionedEntry};
pub use error::{CasheError, CasheResult, CoalesceError, ConfigError, DatabaseError, StoreError};
pub use key::{version_key, KeyScheme, DEFAULT_KEY_PREFIX, VERSION_SUFFIX, WATERMARK_SEGMENT};
pub use watermark::{RefreshWindow, Watermark};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Opaque cached payload as seen by a store.
pub type Payload = serde_json::Value;

/// Requirements on an entity identifier.
///
/// Ids are rendered into keys with `Display`, and compared by content (`Ord`)
/// when a set of missing ids is used as a coalescing key.
pub trait CacheId: Clone + Eq + Hash + Ord + Display + Debug + Send + Sync + 'static {}

impl<T> CacheId for T where T: Clone + Eq + Hash + Ord + Display + Debug + Send + Sync + 'static {}

/// Marker trait for entity types that can be cached.
///
/// Entities are serialized into the store as [`Payload`]s.
pub trait CacheableEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheableEntity for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Convert an entity into a store payload.
pub fn to_payload<T: Serialize>(entity: &T) -> CasheResult<Payload> {
    Ok(serde_json::to_value(entity)?)
}

/// Convert a store payload back into an entity.
pub fn from_payload<T: DeserializeOwned>(payload: Payload) -> CasheResult<T> {
    Ok(serde_json::from_value(payload)?)
}
