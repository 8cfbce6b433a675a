//! Threshold evaluation over bucket history.

use std::sync::Arc;
use tracing::{debug, info, trace};

use super::check::PeriodCheck;
use super::key::Key;
use super::policy::PolicyDefinition;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::BucketStore;

/// Turns recorded event counts into blocking decisions.
///
/// The analyzer is cheap to clone and can be shared across tasks.
#[derive(Clone)]
pub struct Analyzer {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
}

impl Analyzer {
    pub fn new(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Record `count` events for `key` at `timestamp`.
    pub async fn increment(&self, key: &Key, timestamp: i64, count: u64) -> Result<()> {
        trace!(key = %key, timestamp = timestamp, count = count, "Recording events");
        self.store.increment(key, timestamp, count).await
    }

    /// Evaluate the checks of `policy` against the history of `key`.
    ///
    /// Checks are evaluated narrowest period first. The first violated check
    /// blocks the key for its `block_ttl` and is returned; later checks are
    /// not looked at.
    pub async fn check(
        &self,
        key: &Key,
        policy: &PolicyDefinition,
    ) -> Result<Option<PeriodCheck>> {
        let history = self.store.key_history(key).await?;
        let now = self.clock.now();

        for check in policy.checks() {
            let sum = check.window_sum(&history, now);

            debug!(
                key = %key,
                period_seconds = check.period_seconds,
                max_allowed = check.max_allowed,
                sum = sum,
                "Evaluating period check"
            );

            if check.is_exceeded_by(sum) {
                info!(
                    key = %key,
                    period_seconds = check.period_seconds,
                    max_allowed = check.max_allowed,
                    sum = sum,
                    block_ttl = check.block_ttl,
                    "Rate limit exceeded, blocking"
                );
                self.store.rate_limit(key, check.block_ttl).await?;
                return Ok(Some(*check));
            }
        }

        Ok(None)
    }

    /// Identifiers in `scope` with recorded history.
    pub async fn tracked_identifiers(&self, scope: &str) -> Result<Vec<String>> {
        self.store.tracked_keys(scope).await
    }

    /// Identifiers in `scope` that are currently blocked.
    pub async fn rate_limited_identifiers(&self, scope: &str) -> Result<Vec<String>> {
        self.store.rate_limited_keys(scope).await
    }
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzer")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
