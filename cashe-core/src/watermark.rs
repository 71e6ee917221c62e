//! Refresh watermark.
//!
//! The watermark records the wall-clock instant up to which scheduled refresh
//! has processed database updates for one entity type. It is persisted in the
//! backing store as Unix milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in time up to which database updates have been applied to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }

    /// The watermark of a store that never ran a refresh.
    pub fn zero() -> Self {
        Self {
            at: DateTime::UNIX_EPOCH,
        }
    }

    /// The current instant, truncated to the millisecond precision the
    /// watermark is persisted with.
    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis())
    }

    /// Build from persisted milliseconds. Out-of-range values clamp to zero.
    pub fn from_millis(millis: i64) -> Self {
        DateTime::from_timestamp_millis(millis)
            .map(Self::new)
            .unwrap_or_else(Self::zero)
    }

    pub fn as_millis(&self) -> i64 {
        self.at.timestamp_millis()
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn is_zero(&self) -> bool {
        self.at == DateTime::UNIX_EPOCH
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Half-open window `(start, end]` of database update times covered by one
/// refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshWindow {
    pub start: Watermark,
    pub end: Watermark,
}

impl RefreshWindow {
    pub fn new(start: Watermark, end: Watermark) -> Self {
        Self { start, end }
    }

    /// Whether an update at `at` falls inside `(start, end]`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.at() < at && at <= self.end.at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_zero_round_trips_through_millis() {
        assert_eq!(Watermark::from_millis(0), Watermark::zero());
        assert!(Watermark::zero().is_zero());
        assert_eq!(Watermark::default().as_millis(), 0);
    }

    #[test]
    fn test_millis_precision() {
        let wm = Watermark::from_millis(1_706_150_400_123);
        assert_eq!(wm.as_millis(), 1_706_150_400_123);
    }

    #[test]
    fn test_window_is_open_at_start_closed_at_end() {
        let start = Watermark::from_millis(1_000);
        let end = Watermark::from_millis(2_000);
        let window = RefreshWindow::new(start, end);

        assert!(!window.contains(start.at()));
        assert!(window.contains(start.at() + Duration::milliseconds(1)));
        assert!(window.contains(end.at()));
        assert!(!window.contains(end.at() + Duration::milliseconds(1)));
    }
}
