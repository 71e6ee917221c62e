//! CASHE Test Utilities
//!
//! Centralized test infrastructure for the CASHE workspace:
//! - Proptest generators for entries, writes and store operations
//! - Test fixtures for the book catalogue scenario
//! - Custom assertions for CASHE-specific validation
//! - Tracing setup for test binaries

// Re-export the mock database from its source crate
pub use cashe_storage::MockDatabase;

// Re-export core types for convenience
pub use cashe_core::{
    from_payload, to_payload, CacheConfig, CasWrite, CasheError, CasheResult, CoalesceError,
    ConfigError, DatabaseError, KeyScheme, Lookup, Payload, RefreshLoad, StoreError, Version,
    VersionedEntry, Watermark,
};
pub use cashe_storage::{CacheManager, InMemoryVersionedStore, VersionedStore};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber writing through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `cashe_storage=debug`. Safe to call from
/// every test; only the first call per binary installs anything.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cashe_storage=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Entity used throughout the cache tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Book {
    pub id: u64,
    pub name: String,
}

impl Book {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for CASHE types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// A small id space, so generated operations collide on the same keys.
    pub fn arb_book_id() -> impl Strategy<Value = u64> {
        1u64..8
    }

    pub fn arb_book() -> impl Strategy<Value = Book> {
        (arb_book_id(), "[a-z]{1,12}").prop_map(|(id, name)| Book::new(id, name))
    }

    pub fn arb_version() -> impl Strategy<Value = Version> {
        (1u64..1_000).prop_map(Version::new)
    }

    /// Payloads, including negative entries.
    pub fn arb_payload() -> impl Strategy<Value = Option<Payload>> {
        prop_oneof![
            Just(None),
            any::<i64>().prop_map(|n| Some(json!(n))),
            "[a-z]{0,16}".prop_map(|s| Some(json!(s))),
            arb_book().prop_map(|b| Some(json!({ "id": b.id, "name": b.name }))),
        ]
    }

    pub fn arb_cas_write() -> impl Strategy<Value = CasWrite<Payload>> {
        (proptest::option::of(arb_version()), arb_payload())
            .prop_map(|(expected, value)| CasWrite::new(expected, value))
    }

    /// One operation against a single key of a versioned store.
    #[derive(Debug, Clone)]
    pub enum StoreOp {
        /// CAS write holding the version currently stored.
        FreshPut(Option<Payload>),
        /// CAS write holding an arbitrary, possibly stale, baseline.
        BlindPut(Option<Version>, Option<Payload>),
        Invalidate,
        Delete,
    }

    pub fn arb_store_op() -> impl Strategy<Value = StoreOp> {
        prop_oneof![
            3 => arb_payload().prop_map(StoreOp::FreshPut),
            2 => (proptest::option::of(1u64..6), arb_payload())
                .prop_map(|(v, p)| StoreOp::BlindPut(v.map(Version::new), p)),
            2 => Just(StoreOp::Invalidate),
            1 => Just(StoreOp::Delete),
        ]
    }

    pub fn arb_store_ops() -> impl Strategy<Value = Vec<StoreOp>> {
        prop::collection::vec(arb_store_op(), 1..30)
    }

    pub fn arb_refresh_load() -> impl Strategy<Value = RefreshLoad> {
        prop_oneof![Just(RefreshLoad::UpdatedBetween), Just(RefreshLoad::ByIds)]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for the book catalogue scenario.

    use super::*;
    use std::sync::Arc;

    pub type BookDatabase = MockDatabase<u64, Book>;
    pub type BookCache = CacheManager<InMemoryVersionedStore, BookDatabase>;

    /// A database holding `book1` and `book2`.
    pub fn book_database() -> BookDatabase {
        let database = MockDatabase::new("book");
        database.insert(1, Book::new(1, "book1"));
        database.insert(2, Book::new(2, "book2"));
        database
    }

    /// A book cache over a fresh in-memory store and [`book_database`].
    pub fn book_cache() -> (BookCache, Arc<InMemoryVersionedStore>, Arc<BookDatabase>) {
        book_cache_with(CacheConfig::default())
    }

    pub fn book_cache_with(
        config: CacheConfig,
    ) -> (BookCache, Arc<InMemoryVersionedStore>, Arc<BookDatabase>) {
        let store = Arc::new(InMemoryVersionedStore::new());
        let database = Arc::new(book_database());
        let cache = CacheManager::new(Arc::clone(&store), Arc::clone(&database), config)
            .unwrap_or_else(|e| panic!("fixture config rejected: {e}"));
        (cache, store, database)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for CASHE-specific validation.

    use super::*;

    /// Assert that a CasheResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CasheResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a CasheResult is a Database error.
    #[track_caller]
    pub fn assert_database_error<T: std::fmt::Debug>(result: &CasheResult<T>) {
        match result {
            Err(CasheError::Database(_)) => {}
            other => panic!("Expected Database error, got: {:?}", other),
        }
    }

    /// Assert that a CasheResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CasheResult<T>) {
        match result {
            Err(CasheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert the state of one key as reported by a store read.
    #[track_caller]
    pub fn assert_entry(
        entry: &VersionedEntry<Payload>,
        version: Option<u64>,
        lookup: &Lookup<Payload>,
    ) {
        assert_eq!(entry.version, version.map(Version::new), "version mismatch");
        assert_eq!(&entry.lookup, lookup, "lookup mismatch");
    }
}
