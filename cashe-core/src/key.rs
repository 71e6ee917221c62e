//! Logical and physical cache key layout.
//!
//! A logical key is `prefix:entity:id`. It maps onto two physical slots in
//! the backing store: the value slot (the logical key itself) and the
//! version slot (`prefix:entity:id:v`). Each entity type also owns one
//! reserved watermark slot, `prefix:entity:_millis_`.

use std::fmt::Display;

/// Suffix appended to a value key to form its version slot.
pub const VERSION_SUFFIX: &str = ":v";

/// Reserved id segment of the watermark slot.
pub const WATERMARK_SEGMENT: &str = "_millis_";

/// Default namespace prefix.
pub const DEFAULT_KEY_PREFIX: &str = "cashe";

/// Key layout for one entity type.
///
/// The namespace and entity name are fixed at construction so that every key
/// produced by one scheme lives under the same `prefix:entity:` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyScheme {
    prefix: String,
    entity: String,
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entity: entity.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Value slot for an entity id: `prefix:entity:id`.
    pub fn compose<I: Display + ?Sized>(&self, id: &I) -> String {
        format!("{}:{}:{}", self.prefix, self.entity, id)
    }

    /// Value slots for a batch of ids, in input order.
    pub fn compose_all<'a, I, It>(&self, ids: It) -> Vec<String>
    where
        I: Display + 'a,
        It: IntoIterator<Item = &'a I>,
    {
        ids.into_iter().map(|id| self.compose(id)).collect()
    }

    /// Watermark slot for this entity type: `prefix:entity:_millis_`.
    pub fn watermark_key(&self) -> String {
        self.compose(WATERMARK_SEGMENT)
    }
}

/// Version slot paired with a value slot.
pub fn version_key(value_key: &str) -> String {
    let mut key = String::with_capacity(value_key.len() + VERSION_SUFFIX.len());
    key.push_str(value_key);
    key.push_str(VERSION_SUFFIX);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_format() {
        let scheme = KeyScheme::new("cashe", "book");
        assert_eq!(scheme.compose(&2u64), "cashe:book:2");
        assert_eq!(version_key(&scheme.compose(&2u64)), "cashe:book:2:v");
    }

    #[test]
    fn test_watermark_key_format() {
        let scheme = KeyScheme::new(DEFAULT_KEY_PREFIX, "book");
        assert_eq!(scheme.watermark_key(), "cashe:book:_millis_");
    }

    #[test]
    fn test_compose_all_preserves_order() {
        let scheme = KeyScheme::new("p", "e");
        let ids = [3u32, 1, 2];
        assert_eq!(scheme.compose_all(&ids), vec!["p:e:3", "p:e:1", "p:e:2"]);
    }

    #[test]
    fn test_schemes_with_different_entities_do_not_collide() {
        let books = KeyScheme::new("cashe", "book");
        let authors = KeyScheme::new("cashe", "author");
        assert_ne!(books.compose(&1u8), authors.compose(&1u8));
        assert_ne!(books.watermark_key(), authors.watermark_key());
    }
}
