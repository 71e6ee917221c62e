//! Versioned entries: the unit of cached state.
//!
//! Each logical key carries a version counter that moves forward on every
//! overwrite and every invalidation. Writers present the version they observed
//! as a baseline; a write whose baseline no longer matches loses the race.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-key version counter.
///
/// Versions are private to the store. Callers only ever echo back a version
/// they previously read, they never compute one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version established by the first successful write of a key.
    pub const INITIAL: Version = Version(1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version a successful overwrite or invalidation moves to.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Outcome of looking up one key.
///
/// `Hit(None)` is a negative cache entry: the entity is known not to exist.
/// It is distinct from `Miss`, which means nothing is cached for the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lookup<V> {
    Miss,
    Hit(Option<V>),
}

impl<V> Lookup<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// True for a live entry holding no value.
    pub fn is_negative_hit(&self) -> bool {
        matches!(self, Self::Hit(None))
    }

    pub fn map<U, F>(self, f: F) -> Lookup<U>
    where
        F: FnOnce(V) -> U,
    {
        match self {
            Self::Miss => Lookup::Miss,
            Self::Hit(value) => Lookup::Hit(value.map(f)),
        }
    }
}

/// Cached state of exactly one logical key, as reported by a store read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntry<V> {
    /// Version slot contents. `None` for a key that was never written
    /// (or was deleted).
    pub version: Option<Version>,
    /// Value slot contents.
    pub lookup: Lookup<V>,
}

impl<V> VersionedEntry<V> {
    /// A key with neither slot present.
    pub fn absent() -> Self {
        Self {
            version: None,
            lookup: Lookup::Miss,
        }
    }

    /// A key whose value slot is gone but whose version slot survives,
    /// e.g. after an invalidation.
    pub fn invalidated(version: Version) -> Self {
        Self {
            version: Some(version),
            lookup: Lookup::Miss,
        }
    }

    pub fn hit(version: Version, value: Option<V>) -> Self {
        Self {
            version: Some(version),
            lookup: Lookup::Hit(value),
        }
    }

    pub fn is_hit(&self) -> bool {
        self.lookup.is_hit()
    }

    pub fn map<U, F>(self, f: F) -> VersionedEntry<U>
    where
        F: FnOnce(V) -> U,
    {
        VersionedEntry {
            version: self.version,
            lookup: self.lookup.map(f),
        }
    }
}

/// One compare-and-swap write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasWrite<V> {
    /// Baseline the writer observed. `None` when the writer saw no version slot.
    pub expected: Option<Version>,
    /// New value slot contents; `None` writes a negative entry.
    pub value: Option<V>,
}

impl<V> CasWrite<V> {
    pub fn new(expected: Option<Version>, value: Option<V>) -> Self {
        Self { expected, value }
    }
}

/// Decide a single-key CAS against the currently stored version.
///
/// Returns the version to store when the write wins, or `None` when it loses.
/// A key without a version slot accepts any write: the writer's baseline is
/// adopted as the version, or [`Version::INITIAL`] without one. A key with a
/// version slot only accepts a baseline equal to it, and moves one past it.
///
/// Every backend applies this same rule inside its atomic section.
pub fn cas_outcome(stored: Option<Version>, expected: Option<Version>) -> Option<Version> {
    match (stored, expected) {
        (None, Some(baseline)) => Some(baseline),
        (None, None) => Some(Version::INITIAL),
        (Some(current), Some(baseline)) if current == baseline => Some(current.next()),
        (Some(_), _) => None,
    }
}

/// Version an invalidation moves a key to.
pub fn fenced_version(stored: Option<Version>) -> Version {
    stored.map(Version::next).unwrap_or(Version::INITIAL)
}
