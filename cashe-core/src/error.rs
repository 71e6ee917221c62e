//! Error types for CASHE operations

use thiserror::Error;

/// Backing-store errors.
///
/// Every variant is fatal for the call that produced it. The cache never
/// retries a store operation; retry policy belongs to the embedding service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backing store {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Script {script} failed: {reason}")]
    ScriptFailed { script: String, reason: String },

    #[error("Malformed reply from {script}: {reason}")]
    MalformedReply { script: String, reason: String },

    #[error("Cannot decode slot {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Errors raised by the authoritative database collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Load failed for {entity}: {reason}")]
    LoadFailed { entity: String, reason: String },

    #[error("Update failed for {entity}: {reason}")]
    UpdateFailed { entity: String, reason: String },

    #[error("Query failed for {entity}: {reason}")]
    QueryFailed { entity: String, reason: String },
}

/// Request coalescing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoalesceError {
    /// The leader was dropped before it produced a result.
    #[error("In-flight load for {key} was abandoned by its leader")]
    LeaderAbandoned { key: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all CASHE errors.
///
/// `Clone` so that a single loader failure can be handed to every caller
/// waiting on the same coalesced load.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CasheError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Coalesce error: {0}")]
    Coalesce(#[from] CoalesceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

impl From<serde_json::Error> for CasheError {
    fn from(e: serde_json::Error) -> Self {
        CasheError::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Result type alias for CASHE operations.
pub type CasheResult<T> = Result<T, CasheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_unavailable() {
        let err = StoreError::Unavailable {
            backend: "redis".to_string(),
            reason: "connection refused".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("redis"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_database_error_converts_into_master() {
        let err: CasheError = DatabaseError::LoadFailed {
            entity: "book".to_string(),
            reason: "timeout".to_string(),
        }
        .into();
        assert!(matches!(err, CasheError::Database(DatabaseError::LoadFailed { .. })));
        assert_eq!(
            err.to_string(),
            "Database error: Load failed for book: timeout"
        );
    }

    #[test]
    fn test_master_error_is_clone_and_comparable() {
        let err = CasheError::from(CoalesceError::LeaderAbandoned {
            key: "{1, 2}".to_string(),
        });
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_serde_error_becomes_serialization() {
        let raw = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = CasheError::from(raw);
        assert!(matches!(err, CasheError::Serialization { .. }));
    }
}
