//! Bucketed counter and block-marker storage.

mod keys;
mod memory;
mod redis_store;

pub use self::keys::KeySpace;
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{BucketSample, Key};

/// Trait for bucket store implementations.
///
/// A store keeps, per key, a bounded set of time buckets with counts, a
/// TTL-bounded block marker, and per scope a disable flag. Every method
/// reports connectivity loss as [`FloodgateError::StoreUnavailable`] and
/// leaves the fail-open decision to the caller.
///
/// [`FloodgateError::StoreUnavailable`]: crate::error::FloodgateError::StoreUnavailable
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Add `count` to the bucket containing `timestamp` and refresh the key's
    /// history TTL in one atomic step, then trim the oldest buckets beyond
    /// the retention bound.
    async fn increment(&self, key: &Key, timestamp: i64, count: u64) -> Result<()>;

    /// All buckets for `key`, oldest first.
    async fn key_history(&self, key: &Key) -> Result<Vec<BucketSample>>;

    /// Block `key` for `block_ttl` seconds unless it is already blocked for
    /// longer.
    async fn rate_limit(&self, key: &Key, block_ttl: u64) -> Result<()>;

    async fn is_rate_limited(&self, key: &Key) -> Result<bool>;

    /// Remaining block time in seconds, `None` when not blocked.
    async fn block_ttl(&self, key: &Key) -> Result<Option<u64>>;

    /// Identifiers in `scope` that have bucket history.
    async fn tracked_keys(&self, scope: &str) -> Result<Vec<String>>;

    /// Identifiers in `scope` that are currently blocked.
    async fn rate_limited_keys(&self, scope: &str) -> Result<Vec<String>>;

    /// Union of tracked and blocked identifiers, without duplicates.
    async fn all_keys(&self, scope: &str) -> Result<Vec<String>> {
        let mut keys = self.tracked_keys(scope).await?;
        for key in self.rate_limited_keys(scope).await? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Remove history and block markers for every identifier in `scope`.
    async fn delete_rate_limited_keys(&self, scope: &str) -> Result<()>;

    /// Remove history and block marker for one key.
    async fn delete_key(&self, key: &Key) -> Result<()>;

    async fn disable(&self, scope: &str) -> Result<()>;

    async fn enable(&self, scope: &str) -> Result<()>;

    async fn is_enabled(&self, scope: &str) -> Result<bool>;

    async fn is_disabled(&self, scope: &str) -> Result<bool> {
        Ok(!self.is_enabled(scope).await?)
    }
}
