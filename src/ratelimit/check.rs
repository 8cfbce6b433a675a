//! Period checks and bucket samples.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Longest period, block or history accepted anywhere, in seconds (100 years).
///
/// Redis rejects expiries whose millisecond deadline overflows, and the
/// in-memory store does signed arithmetic on them.
pub const MAX_SECONDS: u64 = 100 * 365 * 86_400;

/// A threshold over a trailing time window.
///
/// If more than `max_allowed` events occurred in the last `period_seconds`,
/// the identifier is blocked for `block_ttl` seconds.
///
/// Checks order by `period_seconds` first, so sorting a list of checks puts
/// the narrowest window first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodCheck {
    pub period_seconds: u64,
    pub max_allowed: u64,
    pub block_ttl: u64,
}

impl PeriodCheck {
    pub fn new(period_seconds: u64, max_allowed: u64, block_ttl: u64) -> Self {
        Self {
            period_seconds,
            max_allowed,
            block_ttl,
        }
    }

    /// Oldest bucket timestamp that still falls inside this check's window.
    pub fn window_start(&self, now: i64) -> i64 {
        let period = i64::try_from(self.period_seconds).unwrap_or(i64::MAX);
        now.saturating_sub(period)
    }

    /// Sum of the samples inside this check's window ending at `now`.
    pub fn window_sum(&self, history: &[BucketSample], now: i64) -> u64 {
        let start = self.window_start(now);
        history
            .iter()
            .filter(|sample| sample.timestamp >= start)
            .map(|sample| sample.count)
            .sum()
    }

    /// Whether `sum` events exceed this check's allowance.
    pub fn is_exceeded_by(&self, sum: u64) -> bool {
        sum > self.max_allowed
    }
}

impl Ord for PeriodCheck {
    fn cmp(&self, other: &Self) -> Ordering {
        self.period_seconds
            .cmp(&other.period_seconds)
            .then(self.max_allowed.cmp(&other.max_allowed))
            .then(self.block_ttl.cmp(&other.block_ttl))
    }
}

impl PartialOrd for PeriodCheck {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Accumulated event count for one time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketSample {
    /// Start of the bucket, Unix seconds
    pub timestamp: i64,
    pub count: u64,
}

impl BucketSample {
    pub fn new(timestamp: i64, count: u64) -> Self {
        Self { timestamp, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checks_sort_by_period() {
        let mut checks = vec![
            PeriodCheck::new(3600, 1000, 60),
            PeriodCheck::new(60, 100, 3600),
            PeriodCheck::new(600, 10, 30),
        ];
        checks.sort();

        let periods: Vec<u64> = checks.iter().map(|c| c.period_seconds).collect();
        assert_eq!(periods, vec![60, 600, 3600]);
    }

    #[test]
    fn test_window_sum_excludes_old_buckets() {
        let check = PeriodCheck::new(60, 3, 300);
        let history = vec![
            BucketSample::new(900, 5),
            BucketSample::new(940, 2),
            BucketSample::new(990, 1),
        ];

        // Window is [940, 1000]
        assert_eq!(check.window_sum(&history, 1000), 3);
        // Window is [880, 940]
        assert_eq!(check.window_sum(&history, 940), 8);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let check = PeriodCheck::new(10, 0, 1);
        let history = vec![BucketSample::new(90, 1)];

        assert_eq!(check.window_sum(&history, 100), 1);
        assert_eq!(check.window_sum(&history, 101), 0);
    }

    #[test]
    fn test_huge_period_covers_everything() {
        let check = PeriodCheck::new(u64::MAX, 0, 1);
        let history = vec![BucketSample::new(-1_000_000_000, 1), BucketSample::new(0, 1)];

        assert_eq!(check.window_start(-10), i64::MIN);
        assert_eq!(check.window_sum(&history, 1000), 2);
    }

    #[test]
    fn test_exceeded_means_strictly_greater() {
        let check = PeriodCheck::new(60, 3, 300);
        assert!(!check.is_exceeded_by(3));
        assert!(check.is_exceeded_by(4));
    }

    #[test]
    fn test_samples_order_by_timestamp() {
        let mut samples = vec![BucketSample::new(20, 1), BucketSample::new(10, 9)];
        samples.sort();
        assert_eq!(samples[0].timestamp, 10);
    }
}
