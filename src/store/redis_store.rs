//! Redis-backed bucket store.
//!
//! Bucket history lives in a sorted set per key (member = bucket timestamp,
//! score = count). Block markers and scope flags are plain string keys whose
//! existence is all that matters.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::keys::glob_escape;
use super::{BucketStore, KeySpace};
use crate::config::{BucketConfig, StoreConfig};
use crate::error::Result;
use crate::ratelimit::{BucketSample, Key, MAX_SECONDS};

/// A [`BucketStore`] backed by a Redis-compatible server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    keys: KeySpace,
    buckets: BucketConfig,
}

impl RedisStore {
    /// Connect using the store section of the configuration.
    pub async fn connect(store: &StoreConfig, buckets: BucketConfig) -> Result<Self> {
        let url = store.connection_url();
        info!(url = %url, namespace = ?store.namespace, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(
            connection,
            KeySpace::new(store.namespace.clone()),
            buckets,
        ))
    }

    pub fn with_connection(
        connection: ConnectionManager,
        keys: KeySpace,
        buckets: BucketConfig,
    ) -> Self {
        Self {
            connection,
            keys,
            buckets,
        }
    }

    /// Drop the oldest buckets beyond the retention bound.
    async fn trim(&self, history_key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let keep = self.buckets.time_blocks_to_keep();

        let size: usize = conn.zcard(history_key).await?;
        if size <= keep {
            return Ok(());
        }

        let samples = self.read_samples(history_key).await?;
        let stale = stale_buckets(&samples, keep);
        if !stale.is_empty() {
            debug!(key = %history_key, evicted = stale.len(), "Evicting old buckets");
            let _: () = conn.zrem(history_key, stale).await?;
        }
        Ok(())
    }

    async fn read_samples(&self, history_key: &str) -> Result<Vec<BucketSample>> {
        let mut conn = self.connection.clone();
        let raw: Vec<(String, f64)> = conn.zrange_withscores(history_key, 0, -1).await?;
        Ok(parse_samples(raw))
    }

    async fn identifiers(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(prefix_pattern(prefix)).await?;

        let mut identifiers = KeySpace::identifiers(prefix, keys);
        identifiers.sort();
        Ok(identifiers)
    }
}

/// Turn `ZRANGE ... WITHSCORES` output into samples ordered by bucket.
///
/// Members are bucket timestamps and scores are counts; the sorted set
/// orders by count, so the result is re-sorted. Members that are not
/// integers are skipped.
fn parse_samples(raw: Vec<(String, f64)>) -> Vec<BucketSample> {
    let mut samples: Vec<BucketSample> = raw
        .into_iter()
        .filter_map(|(member, score)| {
            member
                .parse::<i64>()
                .ok()
                .map(|timestamp| BucketSample::new(timestamp, score as u64))
        })
        .collect();
    samples.sort();
    samples
}

/// Bucket members to remove so that at most `keep` of the newest remain.
fn stale_buckets(samples: &[BucketSample], keep: usize) -> Vec<i64> {
    samples
        .iter()
        .take(samples.len().saturating_sub(keep))
        .map(|sample| sample.timestamp)
        .collect()
}

/// `KEYS` pattern matching every key under `prefix` literally.
fn prefix_pattern(prefix: &str) -> String {
    format!("{}*", glob_escape(prefix))
}

/// Expiry argument for Redis, capped at [`MAX_SECONDS`].
fn expiry_seconds(secs: u64) -> i64 {
    i64::try_from(secs.min(MAX_SECONDS)).unwrap_or(i64::MAX)
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn increment(&self, key: &Key, timestamp: i64, count: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let history_key = self.keys.history_key(key);
        let bucket = self.buckets.bucket_for(timestamp);
        let history = expiry_seconds(self.buckets.history_secs);

        redis::pipe()
            .atomic()
            .zincr(&history_key, bucket, count)
            .ignore()
            .expire(&history_key, history)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        if let Err(err) = self.trim(&history_key).await {
            warn!(key = %history_key, error = %err, "Failed to evict old buckets");
        }
        Ok(())
    }

    async fn key_history(&self, key: &Key) -> Result<Vec<BucketSample>> {
        self.read_samples(&self.keys.history_key(key)).await
    }

    async fn rate_limit(&self, key: &Key, block_ttl: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let block_key = self.keys.block_key(key);

        let block_ttl = block_ttl.min(MAX_SECONDS);

        // -2 when missing, -1 when the key has no expiry
        let current_ttl: i64 = conn.ttl(&block_key).await?;
        if expiry_seconds(block_ttl) > current_ttl {
            let _: () = conn.set_ex(&block_key, "1", block_ttl).await?;
        }
        Ok(())
    }

    async fn is_rate_limited(&self, key: &Key) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(self.keys.block_key(key)).await?;
        Ok(exists)
    }

    async fn block_ttl(&self, key: &Key) -> Result<Option<u64>> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(self.keys.block_key(key)).await?;
        Ok((ttl > 0).then_some(ttl as u64))
    }

    async fn tracked_keys(&self, scope: &str) -> Result<Vec<String>> {
        self.identifiers(&self.keys.history_prefix(scope)).await
    }

    async fn rate_limited_keys(&self, scope: &str) -> Result<Vec<String>> {
        self.identifiers(&self.keys.block_prefix(scope)).await
    }

    async fn delete_rate_limited_keys(&self, scope: &str) -> Result<()> {
        let identifiers = self.all_keys(scope).await?;
        if identifiers.is_empty() {
            return Ok(());
        }

        let mut doomed = Vec::with_capacity(identifiers.len() * 2);
        for identifier in identifiers {
            let key = Key::new(scope, identifier);
            doomed.push(self.keys.history_key(&key));
            doomed.push(self.keys.block_key(&key));
        }

        let mut conn = self.connection.clone();
        let _: () = conn.del(doomed).await?;
        Ok(())
    }

    async fn delete_key(&self, key: &Key) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(vec![self.keys.history_key(key), self.keys.block_key(key)])
            .await?;
        Ok(())
    }

    async fn disable(&self, scope: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set(self.keys.disabled_key(scope), "1").await?;
        Ok(())
    }

    async fn enable(&self, scope: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.keys.disabled_key(scope)).await?;
        Ok(())
    }

    async fn is_enabled(&self, scope: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let disabled: bool = conn.exists(self.keys.disabled_key(scope)).await?;
        Ok(!disabled)
    }
}
