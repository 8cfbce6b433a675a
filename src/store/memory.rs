//! In-process bucket store.
//!
//! Mirrors the Redis key layout and TTL semantics on top of a [`DashMap`], so
//! it can stand in for Redis in tests and single-process deployments. Expired
//! entries are dropped when they are next looked at, and every
//! [`EVICTION_INTERVAL`] increments a sweep drops the ones nobody looks at.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{trace, warn};

use super::{BucketStore, KeySpace};
use crate::clock::{Clock, SystemClock};
use crate::config::BucketConfig;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{BucketSample, Key};

/// TTL reported for a key that does not exist.
const TTL_MISSING: i64 = -2;
/// TTL reported for a key that exists without an expiry.
const TTL_PERSISTENT: i64 = -1;
/// Increments between sweeps of expired entries.
pub const EVICTION_INTERVAL: u64 = 100;

#[derive(Debug, Clone)]
enum Entry {
    /// Bucket timestamp -> count
    History {
        buckets: BTreeMap<i64, u64>,
        expires_at: i64,
    },
    /// Presence-only value
    Marker { expires_at: Option<i64> },
}

impl Entry {
    fn expires_at(&self) -> Option<i64> {
        match self {
            Entry::History { expires_at, .. } => Some(*expires_at),
            Entry::Marker { expires_at } => *expires_at,
        }
    }

    fn is_live(&self, now: i64) -> bool {
        self.expires_at().map_or(true, |at| at > now)
    }

    fn ttl(&self, now: i64) -> i64 {
        match self.expires_at() {
            None => TTL_PERSISTENT,
            Some(at) if at > now => at.saturating_sub(now),
            Some(_) => TTL_MISSING,
        }
    }
}

/// A [`BucketStore`] that keeps everything in memory.
#[derive(Debug)]
pub struct MemoryStore {
    keys: KeySpace,
    buckets: BucketConfig,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Entry>,
    /// When set, every operation fails with this reason
    outage: RwLock<Option<String>>,
    ops_counter: AtomicU64,
}

impl MemoryStore {
    /// Create a store using the system clock and no key namespace.
    pub fn new(buckets: BucketConfig) -> Self {
        Self::with_clock(buckets, KeySpace::default(), Arc::new(SystemClock))
    }

    pub fn with_clock(buckets: BucketConfig, keys: KeySpace, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            buckets,
            clock,
            entries: DashMap::new(),
            outage: RwLock::new(None),
            ops_counter: AtomicU64::new(0),
        }
    }

    /// Make every subsequent operation fail with `StoreUnavailable`.
    pub fn simulate_outage(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "Simulating store outage");
        *self.outage.write() = Some(reason);
    }

    /// End a simulated outage.
    pub fn restore(&self) {
        *self.outage.write() = None;
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        match self.outage.read().as_ref() {
            Some(reason) => Err(FloodgateError::StoreUnavailable(reason.clone())),
            None => Ok(()),
        }
    }

    /// Drop every expired entry once per [`EVICTION_INTERVAL`] calls.
    fn maybe_evict_expired(&self, now: i64) {
        let count = self.ops_counter.fetch_add(1, Ordering::Relaxed);
        if count % EVICTION_INTERVAL != 0 {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        trace!(evicted = before.saturating_sub(self.entries.len()), "Swept expired entries");
    }

    fn purge_if_expired(&self, key: &str, now: i64) {
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }

    fn ttl(&self, key: &str, now: i64) -> i64 {
        self.entries
            .get(key)
            .map(|entry| entry.ttl(now))
            .unwrap_or(TTL_MISSING)
    }

    fn live_identifiers(&self, prefix: &str) -> Vec<String> {
        let now = self.clock.now();
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        let mut identifiers = KeySpace::identifiers(prefix, keys);
        identifiers.sort();
        identifiers
    }

    fn delete_all(&self, key: &Key) {
        self.entries.remove(&self.keys.history_key(key));
        self.entries.remove(&self.keys.block_key(key));
    }
}

/// Seconds as a signed offset, saturating at `i64::MAX`.
fn seconds(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn increment(&self, key: &Key, timestamp: i64, count: u64) -> Result<()> {
        self.ensure_available()?;

        let now = self.clock.now();
        // Must run before the entry guard below is taken
        self.maybe_evict_expired(now);

        let bucket = self.buckets.bucket_for(timestamp);
        let expires = now.saturating_add(seconds(self.buckets.history_secs));
        let keep = self.buckets.time_blocks_to_keep();

        let mut entry = self
            .entries
            .entry(self.keys.history_key(key))
            .or_insert_with(|| Entry::History {
                buckets: BTreeMap::new(),
                expires_at: expires,
            });

        if !entry.is_live(now) || !matches!(*entry, Entry::History { .. }) {
            *entry = Entry::History {
                buckets: BTreeMap::new(),
                expires_at: expires,
            };
        }

        if let Entry::History {
            buckets,
            expires_at,
        } = &mut *entry
        {
            let sum = buckets.entry(bucket).or_insert(0);
            *sum = sum.saturating_add(count);
            *expires_at = expires;
            while buckets.len() > keep {
                buckets.pop_first();
            }
        }

        Ok(())
    }

    async fn key_history(&self, key: &Key) -> Result<Vec<BucketSample>> {
        self.ensure_available()?;

        let history_key = self.keys.history_key(key);
        self.purge_if_expired(&history_key, self.clock.now());

        let samples = match self.entries.get(&history_key).as_deref() {
            Some(Entry::History { buckets, .. }) => buckets
                .iter()
                .map(|(timestamp, count)| BucketSample::new(*timestamp, *count))
                .collect(),
            _ => Vec::new(),
        };
        Ok(samples)
    }

    async fn rate_limit(&self, key: &Key, block_ttl: u64) -> Result<()> {
        self.ensure_available()?;

        let now = self.clock.now();
        let block_key = self.keys.block_key(key);
        let current_ttl = self.ttl(&block_key, now);

        let block_ttl = seconds(block_ttl);
        if block_ttl > current_ttl {
            self.entries.insert(
                block_key,
                Entry::Marker {
                    expires_at: Some(now.saturating_add(block_ttl)),
                },
            );
        }
        Ok(())
    }

    async fn is_rate_limited(&self, key: &Key) -> Result<bool> {
        self.ensure_available()?;

        let block_key = self.keys.block_key(key);
        self.purge_if_expired(&block_key, self.clock.now());
        Ok(self.entries.contains_key(&block_key))
    }

    async fn block_ttl(&self, key: &Key) -> Result<Option<u64>> {
        self.ensure_available()?;

        let ttl = self.ttl(&self.keys.block_key(key), self.clock.now());
        Ok((ttl > 0).then_some(ttl as u64))
    }

    async fn tracked_keys(&self, scope: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.live_identifiers(&self.keys.history_prefix(scope)))
    }

    async fn rate_limited_keys(&self, scope: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.live_identifiers(&self.keys.block_prefix(scope)))
    }

    async fn delete_rate_limited_keys(&self, scope: &str) -> Result<()> {
        for identifier in self.all_keys(scope).await? {
            self.delete_all(&Key::new(scope, identifier));
        }
        Ok(())
    }

    async fn delete_key(&self, key: &Key) -> Result<()> {
        self.ensure_available()?;
        self.delete_all(key);
        Ok(())
    }

    async fn disable(&self, scope: &str) -> Result<()> {
        self.ensure_available()?;
        self.entries
            .insert(self.keys.disabled_key(scope), Entry::Marker { expires_at: None });
        Ok(())
    }

    async fn enable(&self, scope: &str) -> Result<()> {
        self.ensure_available()?;
        self.entries.remove(&self.keys.disabled_key(scope));
        Ok(())
    }

    async fn is_enabled(&self, scope: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(!self.entries.contains_key(&self.keys.disabled_key(scope)))
    }
}
