//! In-process versioned store.
//!
//! Keeps the same two-slot physical layout as the remote backends, with one
//! mutex held for the whole of each call. Used by tests and by embedders that
//! only need a process-local cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cashe_core::{
    cas_outcome, fenced_version, version_key, CasWrite, CasheResult, Lookup, Payload, StoreError,
    Version, VersionedEntry, Watermark,
};

use super::traits::VersionedStore;

/// Contents of one physical slot.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Value(Option<Payload>),
    Version(Version),
    Millis(i64),
}

/// In-memory [`VersionedStore`].
#[derive(Debug, Default)]
pub struct InMemoryVersionedStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryVersionedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a physical slot (value, version or watermark key) exists.
    ///
    /// Inspects the slots even after a panic poisoned the lock.
    pub fn contains_slot(&self, physical_key: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(physical_key)
    }

    /// Number of physical slots held, including watermark slots.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>, StoreError> {
        self.slots.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn stored_version(slots: &HashMap<String, Slot>, version_slot: &str) -> Option<Version> {
    match slots.get(version_slot) {
        Some(Slot::Version(version)) => Some(*version),
        _ => None,
    }
}

#[async_trait]
impl VersionedStore for InMemoryVersionedStore {
    async fn get(&self, keys: &[String]) -> CasheResult<Vec<VersionedEntry<Payload>>> {
        let slots = self.lock()?;
        Ok(keys
            .iter()
            .map(|key| {
                let version = stored_version(&slots, &version_key(key));
                let lookup = match slots.get(key) {
                    Some(Slot::Value(value)) => Lookup::Hit(value.clone()),
                    _ => Lookup::Miss,
                };
                VersionedEntry { version, lookup }
            })
            .collect())
    }

    async fn put(&self, writes: &BTreeMap<String, CasWrite<Payload>>) -> CasheResult<Vec<String>> {
        let mut slots = self.lock()?;
        let mut lost = Vec::new();
        for (key, write) in writes {
            let version_slot = version_key(key);
            match cas_outcome(stored_version(&slots, &version_slot), write.expected) {
                Some(next) => {
                    slots.insert(key.clone(), Slot::Value(write.value.clone()));
                    slots.insert(version_slot, Slot::Version(next));
                }
                None => lost.push(key.clone()),
            }
        }
        Ok(lost)
    }

    async fn invalidate(&self, keys: &[String]) -> CasheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut slots = self.lock()?;
        for key in keys {
            let version_slot = version_key(key);
            let next = fenced_version(stored_version(&slots, &version_slot));
            slots.remove(key);
            slots.insert(version_slot, Slot::Version(next));
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CasheResult<()> {
        let mut slots = self.lock()?;
        for key in keys {
            slots.remove(key);
            slots.remove(&version_key(key));
        }
        Ok(())
    }

    async fn save_timestamp(&self, name: &str, watermark: Watermark) -> CasheResult<()> {
        self.lock()?
            .insert(name.to_string(), Slot::Millis(watermark.as_millis()));
        Ok(())
    }

    async fn get_timestamp(&self, name: &str) -> CasheResult<Watermark> {
        let slots = self.lock()?;
        Ok(match slots.get(name) {
            Some(Slot::Millis(millis)) => Watermark::from_millis(*millis),
            _ => Watermark::zero(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashe_core::CasheError;
    use serde_json::json;

    fn keys(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|k| k.to_string()).collect()
    }

    fn write(expected: Option<u64>, value: Option<Payload>) -> CasWrite<Payload> {
        CasWrite::new(expected.map(Version::new), value)
    }

    async fn put_one(
        store: &InMemoryVersionedStore,
        key: &str,
        cas: CasWrite<Payload>,
    ) -> Vec<String> {
        let mut writes = BTreeMap::new();
        writes.insert(key.to_string(), cas);
        store.put(&writes).await.unwrap()
    }

    #[tokio::test]
    async fn test_untouched_key_is_absent() {
        let store = InMemoryVersionedStore::new();
        let entries = store.get(&keys(&["a"])).await.unwrap();
        assert_eq!(entries, vec![VersionedEntry::absent()]);
    }

    #[tokio::test]
    async fn test_first_write_establishes_version_one() {
        let store = InMemoryVersionedStore::new();
        assert!(put_one(&store, "a", write(None, Some(json!("x")))).await.is_empty());

        let entries = store.get(&keys(&["a"])).await.unwrap();
        assert_eq!(entries[0], VersionedEntry::hit(Version::INITIAL, Some(json!("x"))));
    }

    #[tokio::test]
    async fn test_matching_baseline_overwrites_and_bumps() {
        let store = InMemoryVersionedStore::new();
        put_one(&store, "a", write(None, Some(json!(1)))).await;
        assert!(put_one(&store, "a", write(Some(1), Some(json!(2)))).await.is_empty());

        let entries = store.get(&keys(&["a"])).await.unwrap();
        assert_eq!(entries[0], VersionedEntry::hit(Version::new(2), Some(json!(2))));
    }

    #[tokio::test]
    async fn test_stale_baseline_is_reported_and_skipped() {
        let store = InMemoryVersionedStore::new();
        put_one(&store, "a", write(None, Some(json!(1)))).await;
        put_one(&store, "a", write(Some(1), Some(json!(2)))).await;

        let lost = put_one(&store, "a", write(Some(1), Some(json!("stale")))).await;
        assert_eq!(lost, keys(&["a"]));
        let entries = store.get(&keys(&["a"])).await.unwrap();
        assert_eq!(entries[0].lookup, Lookup::Hit(Some(json!(2))));
    }

    #[tokio::test]
    async fn test_invalidate_fences_older_baseline() {
        let store = InMemoryVersionedStore::new();
        put_one(&store, "a", write(None, Some(json!(1)))).await;
        let baseline = store.get(&keys(&["a"])).await.unwrap()[0].version;

        store.invalidate(&keys(&["a"])).await.unwrap();
        let entries = store.get(&keys(&["a"])).await.unwrap();
        assert_eq!(entries[0], VersionedEntry::invalidated(Version::new(2)));

        let lost = put_one(&store, "a", CasWrite::new(baseline, Some(json!("late")))).await;
        assert_eq!(lost, keys(&["a"]));
        assert!(!store.get(&keys(&["a"])).await.unwrap()[0].is_hit());
    }

    #[tokio::test]
    async fn test_negative_entry_is_a_hit() {
        let store = InMemoryVersionedStore::new();
        put_one(&store, "a", write(None, None)).await;
        let entries = store.get(&keys(&["a"])).await.unwrap();
        assert_eq!(entries[0], VersionedEntry::hit(Version::INITIAL, None));
    }

    #[tokio::test]
    async fn test_delete_removes_both_slots() {
        let store = InMemoryVersionedStore::new();
        put_one(&store, "a", write(None, Some(json!(1)))).await;
        assert!(store.contains_slot("a") && store.contains_slot("a:v"));
        assert_eq!(store.slot_count(), 2);

        store.delete(&keys(&["a"])).await.unwrap();
        assert!(!store.contains_slot("a"));
        assert!(!store.contains_slot("a:v"));
        assert_eq!(store.slot_count(), 0);
        assert_eq!(store.get(&keys(&["a"])).await.unwrap()[0], VersionedEntry::absent());
    }

    #[tokio::test]
    async fn test_poisoned_lock_fails_calls_but_keeps_slots_visible() {
        let store = InMemoryVersionedStore::new();
        put_one(&store, "a", write(None, Some(json!(1)))).await;
        store.save_timestamp("w", Watermark::from_millis(7)).await.unwrap();

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _slots = store.slots.lock().unwrap();
            panic!("panic while holding the slot lock");
        }));
        assert!(poisoned.is_err());

        let err = store.get(&keys(&["a"])).await.unwrap_err();
        assert!(matches!(err, CasheError::Store(StoreError::LockPoisoned)), "got {err:?}");
        assert!(store.contains_slot("a"));
        assert!(store.contains_slot("a:v"));
        assert_eq!(store.slot_count(), 3);
    }

    #[tokio::test]
    async fn test_get_preserves_input_order() {
        let store = InMemoryVersionedStore::new();
        put_one(&store, "b", write(None, Some(json!("b")))).await;
        let entries = store.get(&keys(&["a", "b", "a"])).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(!entries[0].is_hit());
        assert_eq!(entries[1].lookup, Lookup::Hit(Some(json!("b"))));
        assert!(!entries[2].is_hit());
    }

    #[tokio::test]
    async fn test_timestamp_defaults_to_zero() {
        let store = InMemoryVersionedStore::new();
        assert_eq!(store.get_timestamp("w").await.unwrap(), Watermark::zero());

        let wm = Watermark::from_millis(42_000);
        store.save_timestamp("w", wm).await.unwrap();
        assert_eq!(store.get_timestamp("w").await.unwrap(), wm);
    }
}
