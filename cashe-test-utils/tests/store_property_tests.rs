//! Property-Based Tests for the Versioned CAS Store
//!
//! **Property 1: Model Agreement**
//!
//! For any sequence of CAS writes, invalidations and deletes against one key,
//! the in-memory store SHALL report exactly the version and value of a simple
//! reference model after every step.
//!
//! **Property 2: Fencing**
//!
//! For any store state, a write holding a baseline read before an
//! invalidation SHALL lose, and SHALL leave the key invalidated.
//!
//! **Property 3: Monotonic Versions**
//!
//! Versions SHALL never decrease except through delete.
//!
//! **Property 4: Batch Losers**
//!
//! For any batch of CAS writes over keys at known versions, `put` SHALL
//! report exactly the writes whose baseline does not match, apply every
//! other write, and leave the losing keys untouched.

use std::collections::{BTreeMap, BTreeSet};

use cashe_test_utils::assertions::assert_entry;
use cashe_test_utils::generators::{
    arb_book_id, arb_cas_write, arb_payload, arb_store_ops, StoreOp,
};
use cashe_test_utils::{
    CasWrite, InMemoryVersionedStore, Lookup, Payload, Version, VersionedEntry, VersionedStore,
};
use proptest::prelude::*;

const KEY: &str = "cashe:book:1";

// ============================================================================
// REFERENCE MODEL
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Model {
    version: Option<u64>,
    value: Option<Option<Payload>>,
}

impl Model {
    /// Returns whether the write was accepted.
    fn put(&mut self, expected: Option<u64>, value: Option<Payload>) -> bool {
        let next = match (self.version, expected) {
            (None, None) => 1,
            (None, Some(baseline)) => baseline,
            (Some(current), Some(baseline)) if current == baseline => current + 1,
            (Some(_), _) => return false,
        };
        self.version = Some(next);
        self.value = Some(value);
        true
    }

    fn invalidate(&mut self) {
        self.version = Some(self.version.map_or(1, |v| v + 1));
        self.value = None;
    }

    fn delete(&mut self) {
        *self = Self::default();
    }

    fn entry(&self) -> VersionedEntry<Payload> {
        VersionedEntry {
            version: self.version.map(Version::new),
            lookup: match &self.value {
                Some(value) => Lookup::Hit(value.clone()),
                None => Lookup::Miss,
            },
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime should build")
        .block_on(future)
}

fn keys() -> Vec<String> {
    vec![KEY.to_string()]
}

async fn read(store: &InMemoryVersionedStore) -> VersionedEntry<Payload> {
    store.get(&keys()).await.unwrap().remove(0)
}

async fn put(store: &InMemoryVersionedStore, expected: Option<Version>, value: Option<Payload>) -> bool {
    let mut writes = BTreeMap::new();
    writes.insert(KEY.to_string(), CasWrite::new(expected, value));
    store.put(&writes).await.unwrap().is_empty()
}

fn book_key(id: u64) -> String {
    format!("cashe:book:{id}")
}

/// Whether a write holding `expected` wins against `current`.
fn wins(current: Option<u64>, expected: Option<Version>) -> bool {
    match (current, expected) {
        (None, _) => true,
        (Some(current), Some(expected)) => current == expected.get(),
        (Some(_), None) => false,
    }
}

async fn apply(store: &InMemoryVersionedStore, op: &StoreOp) {
    match op {
        StoreOp::FreshPut(value) => {
            let baseline = read(store).await.version;
            put(store, baseline, value.clone()).await;
        }
        StoreOp::BlindPut(expected, value) => {
            put(store, *expected, value.clone()).await;
        }
        StoreOp::Invalidate => store.invalidate(&keys()).await.unwrap(),
        StoreOp::Delete => store.delete(&keys()).await.unwrap(),
    }
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_store_agrees_with_model(ops in arb_store_ops()) {
        block_on(async {
            let store = InMemoryVersionedStore::new();
            let mut model = Model::default();

            for op in &ops {
                let accepted_by_model = match op {
                    StoreOp::FreshPut(value) => model.put(model.version, value.clone()),
                    StoreOp::BlindPut(expected, value) => {
                        model.put(expected.map(Version::get), value.clone())
                    }
                    StoreOp::Invalidate => {
                        model.invalidate();
                        true
                    }
                    StoreOp::Delete => {
                        model.delete();
                        true
                    }
                };
                apply(&store, op).await;

                prop_assert_eq!(read(&store).await, model.entry(), "after {:?} (accepted: {})", op, accepted_by_model);
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_invalidate_fences_earlier_baselines(
        ops in arb_store_ops(),
        late_value in arb_payload(),
    ) {
        block_on(async {
            let store = InMemoryVersionedStore::new();
            for op in &ops {
                apply(&store, op).await;
            }

            let baseline = read(&store).await.version;
            store.invalidate(&keys()).await.unwrap();
            let fenced = read(&store).await;

            prop_assert!(!put(&store, baseline, late_value).await, "stale write accepted");
            prop_assert_eq!(read(&store).await, fenced.clone());
            prop_assert!(!fenced.is_hit());
            prop_assert!(fenced.version > baseline);
            Ok(())
        })?;
    }

    #[test]
    fn prop_versions_only_decrease_on_delete(ops in arb_store_ops()) {
        block_on(async {
            let store = InMemoryVersionedStore::new();
            let mut last = 0u64;
            for op in &ops {
                apply(&store, op).await;
                let now = read(&store).await.version.map_or(0, Version::get);
                if matches!(op, StoreOp::Delete) {
                    prop_assert_eq!(now, 0);
                } else {
                    prop_assert!(now >= last, "version went from {} to {} on {:?}", last, now, op);
                }
                last = now;
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_batch_put_reports_exactly_the_losers(
        seeded in prop::collection::btree_map(arb_book_id(), 1u64..4, 0..6),
        batch in prop::collection::btree_map(
            arb_book_id(),
            (arb_cas_write(), any::<bool>()),
            1..8,
        ),
    ) {
        block_on(async {
            let store = InMemoryVersionedStore::new();
            // n invalidations leave a key at version n with no value
            for (id, n) in &seeded {
                for _ in 0..*n {
                    store.invalidate(&[book_key(*id)]).await.unwrap();
                }
            }

            let mut writes = BTreeMap::new();
            let mut expected_losers = BTreeSet::new();
            for (id, (write, use_current)) in &batch {
                let current = seeded.get(id).copied();
                let mut write = write.clone();
                if *use_current {
                    write.expected = current.map(Version::new);
                }
                if !wins(current, write.expected) {
                    expected_losers.insert(book_key(*id));
                }
                writes.insert(book_key(*id), write);
            }

            let lost: BTreeSet<String> = store.put(&writes).await.unwrap().into_iter().collect();
            prop_assert_eq!(&lost, &expected_losers);

            for id in batch.keys() {
                let key = book_key(*id);
                let entry = store.get(&[key.clone()]).await.unwrap().remove(0);
                let current = seeded.get(id).copied();
                if lost.contains(&key) {
                    assert_entry(&entry, current, &Lookup::Miss);
                } else {
                    let applied = &writes[&key];
                    let version = match current {
                        Some(v) => v + 1,
                        None => applied.expected.map_or(1, Version::get),
                    };
                    assert_entry(&entry, Some(version), &Lookup::Hit(applied.value.clone()));
                }
            }
            Ok(())
        })?;
    }
}
