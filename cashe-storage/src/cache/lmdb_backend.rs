//! LMDB-backed versioned store.
//!
//! Uses the heed crate (Rust bindings for LMDB) as an embedded backing
//! store. LMDB serializes writers, so running each batch inside one write
//! transaction gives the same all-or-nothing behaviour the remote backend
//! gets from server-side scripts.
//!
//! # Slot Layout
//!
//! - Value slot `key`: JSON slot envelope (see [`cashe_core::encode_slot`])
//! - Version slot `key:v`: big-endian `u64`
//! - Watermark slot: big-endian `i64` Unix milliseconds

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cashe_core::{
    cas_outcome, decode_slot, encode_slot, fenced_version, version_key, CasWrite, CasheError,
    CasheResult, Lookup, Payload, StoreError, Version, VersionedEntry, Watermark,
};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};

use super::traits::VersionedStore;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A version or watermark slot does not hold 8 bytes.
    #[error("Corrupt numeric slot {key}")]
    CorruptSlot { key: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbStoreError to CasheError.
impl From<LmdbStoreError> for CasheError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::CorruptSlot { key } => CasheError::Store(StoreError::Codec {
                key,
                reason: "expected 8 bytes".to_string(),
            }),
            other => CasheError::Store(StoreError::Unavailable {
                backend: "lmdb".to_string(),
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// Location and size of an LMDB environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmdbConfig {
    /// Directory where LMDB files are stored.
    pub path: PathBuf,
    /// Maximum size of the memory map in megabytes.
    pub max_size_mb: usize,
}

impl LmdbConfig {
    pub fn new(path: impl Into<PathBuf>, max_size_mb: usize) -> Self {
        Self {
            path: path.into(),
            max_size_mb,
        }
    }
}

/// LMDB-backed [`VersionedStore`].
///
/// # Example
///
/// ```ignore
/// use cashe_storage::cache::{LmdbConfig, LmdbVersionedStore};
///
/// let store = LmdbVersionedStore::open(&LmdbConfig::new("/tmp/cashe", 64))?;
/// let entries = store.get(&["cashe:book:2".to_string()]).await?;
/// ```
pub struct LmdbVersionedStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
}

impl LmdbVersionedStore {
    /// Open (or create) a store described by `config`.
    pub fn open(config: &LmdbConfig) -> Result<Self, LmdbStoreError> {
        Self::new(&config.path, config.max_size_mb)
    }

    /// Create a new LMDB store.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment directory is owned by this store; it is not
        // opened twice within one process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok(Self { env, db })
    }

    fn read_u64(&self, txn: &RoTxn<'_>, key: &str) -> Result<Option<u64>, LmdbStoreError> {
        match self.db.get(txn, key.as_bytes()).map_err(txn_error)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| LmdbStoreError::CorruptSlot {
                        key: key.to_string(),
                    })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn read_version(&self, txn: &RoTxn<'_>, key: &str) -> Result<Option<Version>, LmdbStoreError> {
        Ok(self.read_u64(txn, &version_key(key))?.map(Version::new))
    }
}

#[async_trait]
impl VersionedStore for LmdbVersionedStore {
    async fn get(&self, keys: &[String]) -> CasheResult<Vec<VersionedEntry<Payload>>> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let version = self.read_version(&rtxn, key)?;
            let lookup = match self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)? {
                Some(bytes) => Lookup::Hit(decode_slot(key, bytes)?),
                None => Lookup::Miss,
            };
            entries.push(VersionedEntry { version, lookup });
        }
        Ok(entries)
    }

    async fn put(&self, writes: &BTreeMap<String, CasWrite<Payload>>) -> CasheResult<Vec<String>> {
        // Encode before opening the write transaction so a codec failure
        // cannot leave a batch half-applied.
        let mut encoded = Vec::with_capacity(writes.len());
        for (key, write) in writes {
            encoded.push((key, write.expected, encode_slot(key, write.value.as_ref())?));
        }

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut lost = Vec::new();
        for (key, expected, bytes) in encoded {
            let stored = self.read_version(&wtxn, key)?;
            match cas_outcome(stored, expected) {
                Some(next) => {
                    self.db
                        .put(&mut wtxn, key.as_bytes(), &bytes)
                        .map_err(txn_error)?;
                    self.db
                        .put(
                            &mut wtxn,
                            version_key(key).as_bytes(),
                            &next.get().to_be_bytes(),
                        )
                        .map_err(txn_error)?;
                }
                None => lost.push(key.clone()),
            }
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(lost)
    }

    async fn invalidate(&self, keys: &[String]) -> CasheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        for key in keys {
            let next = fenced_version(self.read_version(&wtxn, key)?);
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(txn_error)?;
            self.db
                .put(
                    &mut wtxn,
                    version_key(key).as_bytes(),
                    &next.get().to_be_bytes(),
                )
                .map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CasheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        for key in keys {
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(txn_error)?;
            self.db
                .delete(&mut wtxn, version_key(key).as_bytes())
                .map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    async fn save_timestamp(&self, name: &str, watermark: Watermark) -> CasheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(
                &mut wtxn,
                name.as_bytes(),
                &watermark.as_millis().to_be_bytes(),
            )
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    async fn get_timestamp(&self, name: &str) -> CasheResult<Watermark> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        Ok(self
            .read_u64(&rtxn, name)?
            .map(|raw| Watermark::from_millis(raw as i64))
            .unwrap_or_else(Watermark::zero))
    }
}
