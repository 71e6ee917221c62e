//! Redis-backed versioned store.
//!
//! Multi-key operations run as Lua scripts, which Redis executes atomically:
//! no other command interleaves with a script, so a whole batch of keys is
//! read or CAS-written as one unit.
//!
//! # Key Layout
//!
//! - Value key `prefix:entity:id`: JSON slot envelope
//! - Version key `prefix:entity:id:v`: integer, advanced with `INCR`
//! - Watermark key `prefix:entity:_millis_`: Unix milliseconds
//!
//! Scripts receive all value keys followed by all version keys in `KEYS`,
//! so `KEYS[i]` pairs with `KEYS[n + i]`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cashe_core::{
    decode_slot, encode_slot, version_key, CasWrite, CasheError, CasheResult, ConfigError,
    Lookup, Payload, StoreError, Version, VersionedEntry, Watermark,
};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;

use super::traits::VersionedStore;

/// Default connection URL.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default connection pool size.
pub const DEFAULT_REDIS_POOL_SIZE: usize = 16;

/// Reads value and version slots for every key.
///
/// Returns one `{value, version}` pair per key; missing slots come back as nil.
pub(crate) const GET_VERSIONED_VALUES_SCRIPT: &str = r"
local n = #KEYS / 2
local result = {}
for i = 1, n do
    local value = redis.call('GET', KEYS[i])
    local version = redis.call('GET', KEYS[n + i])
    result[i] = { value or false, version or false }
end
return result
";

/// Compare-and-swap write of every key.
///
/// `ARGV[i]` is the encoded value for `KEYS[i]`, `ARGV[n + i]` the expected
/// version (empty string when the writer saw no version). A key without a
/// version slot is written unconditionally and takes the expected version,
/// or 1. A key with a version slot is only written when the expected version
/// matches, and its version is incremented. Returns the value keys whose
/// write was skipped.
pub(crate) const PUT_VERSIONED_VALUES_SCRIPT: &str = r"
local n = #KEYS / 2
local failed = {}
for i = 1, n do
    local version_key = KEYS[n + i]
    local expected = ARGV[n + i]
    local current = redis.call('GET', version_key)
    if not current then
        redis.call('SET', KEYS[i], ARGV[i])
        if expected == '' then
            redis.call('SET', version_key, 1)
        else
            redis.call('SET', version_key, expected)
        end
    elseif expected ~= '' and tonumber(current) == tonumber(expected) then
        redis.call('SET', KEYS[i], ARGV[i])
        redis.call('INCR', version_key)
    else
        failed[#failed + 1] = KEYS[i]
    end
end
return failed
";

/// Drops every value key and increments its version key.
pub(crate) const CLEAR_VALUES_INCR_VERSIONS_SCRIPT: &str = r"
local n = #KEYS / 2
for i = 1, n do
    redis.call('DEL', KEYS[i])
    redis.call('INCR', KEYS[n + i])
end
return n
";

/// Error type for Redis store operations.
#[derive(Debug, thiserror::Error)]
pub enum RedisStoreError {
    /// No connection could be checked out of the pool.
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The pool could not be built from its configuration.
    #[error("Pool creation failed: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    /// A plain command failed.
    #[error("Redis command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// A script failed to run or returned an error.
    #[error("Script {script} failed: {source}")]
    Script {
        script: &'static str,
        #[source]
        source: redis::RedisError,
    },
}

/// Convert RedisStoreError to CasheError.
impl From<RedisStoreError> for CasheError {
    fn from(e: RedisStoreError) -> Self {
        let store_error = match e {
            RedisStoreError::Script { script, source } => StoreError::ScriptFailed {
                script: script.to_string(),
                reason: source.to_string(),
            },
            other => StoreError::Unavailable {
                backend: "redis".to_string(),
                reason: other.to_string(),
            },
        };
        CasheError::Store(store_error)
    }
}

/// Connection settings for the Redis store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://:password@127.0.0.1:6379/0`.
    pub url: String,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            pool_size: DEFAULT_REDIS_POOL_SIZE,
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Create RedisConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CASHE_REDIS_URL`: Connection URL (default: `redis://127.0.0.1:6379`)
    /// - `CASHE_REDIS_POOL_SIZE`: Maximum pooled connections (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("CASHE_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

        let pool_size = match std::env::var("CASHE_REDIS_POOL_SIZE") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                field: "CASHE_REDIS_POOL_SIZE".to_string(),
                value: raw.clone(),
                reason: "expected a positive integer".to_string(),
            })?,
            Err(_) => DEFAULT_REDIS_POOL_SIZE,
        };
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CASHE_REDIS_POOL_SIZE".to_string(),
                value: "0".to_string(),
                reason: "expected a positive integer".to_string(),
            });
        }

        Ok(Self { url, pool_size })
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Build a tokio connection pool.
    pub fn create_pool(&self) -> Result<Pool, RedisStoreError> {
        let mut config = Config::from_url(self.url.clone());
        config.pool = Some(PoolConfig::new(self.pool_size));
        Ok(config.create_pool(Some(Runtime::Tokio1))?)
    }
}

/// Redis-backed [`VersionedStore`].
pub struct RedisVersionedStore {
    pool: Pool,
    get_script: redis::Script,
    put_script: redis::Script,
    invalidate_script: redis::Script,
}

impl RedisVersionedStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            get_script: redis::Script::new(GET_VERSIONED_VALUES_SCRIPT),
            put_script: redis::Script::new(PUT_VERSIONED_VALUES_SCRIPT),
            invalidate_script: redis::Script::new(CLEAR_VALUES_INCR_VERSIONS_SCRIPT),
        }
    }

    /// Create a store with a pool built from `config`.
    pub fn connect(config: &RedisConfig) -> Result<Self, RedisStoreError> {
        Ok(Self::new(config.create_pool()?))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, RedisStoreError> {
        Ok(self.pool.get().await?)
    }
}

/// All value keys followed by all version keys.
fn keys_and_versions<'a, I>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
    I::IntoIter: Clone,
{
    let keys = keys.into_iter();
    keys.clone()
        .cloned()
        .chain(keys.map(|key| version_key(key)))
        .collect()
}

#[async_trait]
impl VersionedStore for RedisVersionedStore {
    async fn get(&self, keys: &[String]) -> CasheResult<Vec<VersionedEntry<Payload>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut invocation = self.get_script.prepare_invoke();
        for key in keys_and_versions(keys) {
            invocation.key(key);
        }

        let mut connection = self.connection().await?;
        let rows: Vec<(Option<Vec<u8>>, Option<u64>)> = invocation
            .invoke_async(&mut *connection)
            .await
            .map_err(|source| RedisStoreError::Script {
                script: "get_versioned_values",
                source,
            })?;

        if rows.len() != keys.len() {
            return Err(StoreError::MalformedReply {
                script: "get_versioned_values".to_string(),
                reason: format!("expected {} rows, got {}", keys.len(), rows.len()),
            }
            .into());
        }

        keys.iter()
            .zip(rows)
            .map(|(key, (value, version))| {
                let lookup = match value {
                    Some(bytes) => Lookup::Hit(decode_slot(key, &bytes)?),
                    None => Lookup::Miss,
                };
                Ok(VersionedEntry {
                    version: version.map(Version::new),
                    lookup,
                })
            })
            .collect()
    }

    async fn put(&self, writes: &BTreeMap<String, CasWrite<Payload>>) -> CasheResult<Vec<String>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        let mut invocation = self.put_script.prepare_invoke();
        for key in keys_and_versions(writes.keys()) {
            invocation.key(key);
        }
        for (key, write) in writes {
            invocation.arg(encode_slot(key, write.value.as_ref())?);
        }
        for write in writes.values() {
            let expected = write
                .expected
                .map(|version| version.get().to_string())
                .unwrap_or_default();
            invocation.arg(expected);
        }

        let mut connection = self.connection().await?;
        let lost: Vec<String> = invocation
            .invoke_async(&mut *connection)
            .await
            .map_err(|source| RedisStoreError::Script {
                script: "put_versioned_values",
                source,
            })?;
        Ok(lost)
    }

    async fn invalidate(&self, keys: &[String]) -> CasheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut invocation = self.invalidate_script.prepare_invoke();
        for key in keys_and_versions(keys) {
            invocation.key(key);
        }

        let mut connection = self.connection().await?;
        invocation
            .invoke_async::<i64>(&mut *connection)
            .await
            .map_err(|source| RedisStoreError::Script {
                script: "clear_values_incr_versions",
                source,
            })?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CasheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection().await?;
        connection
            .del::<_, i64>(keys_and_versions(keys))
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }

    async fn save_timestamp(&self, name: &str, watermark: Watermark) -> CasheResult<()> {
        let mut connection = self.connection().await?;
        connection
            .set::<_, _, ()>(name, watermark.as_millis())
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }

    async fn get_timestamp(&self, name: &str) -> CasheResult<Watermark> {
        let mut connection = self.connection().await?;
        let millis: Option<i64> = connection
            .get(name)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(millis.map(Watermark::from_millis).unwrap_or_else(Watermark::zero))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_and_versions_pairs_by_position() {
        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(keys_and_versions(&keys), vec!["a", "b", "a:v", "b:v"]);
    }

    #[test]
    fn test_put_script_compares_before_writing() {
        let compare = PUT_VERSIONED_VALUES_SCRIPT
            .find("tonumber(current) == tonumber(expected)")
            .expect("script should compare versions");
        let incr = PUT_VERSIONED_VALUES_SCRIPT
            .find("redis.call('INCR', version_key)")
            .expect("script should bump the version");
        assert!(compare < incr);
    }

    #[test]
    fn test_put_script_treats_missing_baseline_as_lost_race() {
        assert!(PUT_VERSIONED_VALUES_SCRIPT.contains("elseif expected ~= '' and"));
    }

    #[test]
    fn test_invalidate_script_bumps_rather_than_deletes_version() {
        assert!(CLEAR_VALUES_INCR_VERSIONS_SCRIPT.contains("redis.call('DEL', KEYS[i])"));
        assert!(CLEAR_VALUES_INCR_VERSIONS_SCRIPT.contains("redis.call('INCR', KEYS[n + i])"));
        assert!(!CLEAR_VALUES_INCR_VERSIONS_SCRIPT.contains("'DEL', KEYS[n + i]"));
    }

    #[test]
    fn test_redis_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, DEFAULT_REDIS_URL);
        assert_eq!(config.pool_size, DEFAULT_REDIS_POOL_SIZE);
        assert_eq!(RedisConfig::new("redis://cache:6379").with_pool_size(4).pool_size, 4);
    }
}
