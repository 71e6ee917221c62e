//! Configuration types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::key::DEFAULT_KEY_PREFIX;
use crate::ConfigError;

/// How scheduled refresh loads the entities it found in its update window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshLoad {
    /// Second query by update window (`updated_between`). An entity updated
    /// again between the id query and this query can be missed and is then
    /// written as a negative entry until the next pass.
    #[default]
    UpdatedBetween,
    /// Reload the found ids by primary key (`load`), which always observes
    /// the current record.
    ByIds,
}

impl FromStr for RefreshLoad {
    type Err = ConfigError;

    /// Accepts hyphen or underscore separators, case-insensitively.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().replace('_', "-").as_str() {
            "updated-between" => Ok(Self::UpdatedBetween),
            "by-ids" => Ok(Self::ByIds),
            _ => Err(ConfigError::InvalidValue {
                field: "refresh_load".to_string(),
                value: value.to_string(),
                reason: "expected updated-between or by-ids".to_string(),
            }),
        }
    }
}

impl fmt::Display for RefreshLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdatedBetween => write!(f, "updated-between"),
            Self::ByIds => write!(f, "by-ids"),
        }
    }
}

/// Configuration for a cache manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Namespace prefix of every key (default: `cashe`).
    pub key_prefix: String,
    /// Entity loading strategy of scheduled refresh.
    pub refresh_load: RefreshLoad,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            refresh_load: RefreshLoad::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CASHE_KEY_PREFIX`: Namespace prefix (default: `cashe`)
    /// - `CASHE_REFRESH_LOAD`: `updated-between` or `by-ids` (default: `updated-between`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let key_prefix =
            std::env::var("CASHE_KEY_PREFIX").unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string());

        let refresh_load = match std::env::var("CASHE_REFRESH_LOAD") {
            Ok(raw) => raw.parse()?,
            Err(_) => RefreshLoad::default(),
        };

        let config = Self {
            key_prefix,
            refresh_load,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the refresh loading strategy.
    pub fn with_refresh_load(mut self, refresh_load: RefreshLoad) -> Self {
        self.refresh_load = refresh_load;
        self
    }

    /// The prefix must be a single non-empty key segment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key_prefix".to_string(),
            });
        }
        if self.key_prefix.contains(':') {
            return Err(ConfigError::InvalidValue {
                field: "key_prefix".to_string(),
                value: self.key_prefix.clone(),
                reason: "must not contain ':'".to_string(),
            });
        }
        Ok(())
    }
}
