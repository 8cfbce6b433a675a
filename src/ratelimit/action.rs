//! Caller-facing handles for recording events and querying blocks.
//!
//! A [`Policy`] is a registered scope bound to a [`Context`]; it carries the
//! scope-wide operations (enumeration, unblock-all, enable/disable). An
//! [`Action`] is a policy applied to one identifier.
//!
//! Both resolve the store-unavailable condition through the fail mode: when
//! failing open, the most permissive outcome is returned instead of an error.

use std::sync::Arc;
use tracing::{info, warn};

use super::check::PeriodCheck;
use super::key::Key;
use super::policy::{FailMode, PolicyDefinition};
use crate::context::Context;
use crate::error::Result;

/// Convert a store-unavailable error into `fallback` when failing open.
fn recover<T>(
    mode: FailMode,
    operation: &'static str,
    result: Result<T>,
    fallback: impl FnOnce() -> T,
) -> Result<T> {
    match result {
        Err(err) if err.is_store_unavailable() && mode.is_open() => {
            warn!(operation = operation, error = %err, "Store unavailable, failing open");
            Ok(fallback())
        }
        other => other,
    }
}

/// Options for recording events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub count: u64,
    /// Unix seconds; the context clock when unset
    pub timestamp: Option<i64>,
    /// Per-call fail mode override
    pub fail_mode: Option<FailMode>,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            count: 1,
            timestamp: None,
            fail_mode: None,
        }
    }
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = Some(fail_mode);
        self
    }
}

/// A registered scope, ready to act on identifiers.
#[derive(Debug, Clone)]
pub struct Policy<'a> {
    context: &'a Context,
    definition: Arc<PolicyDefinition>,
}

impl<'a> Policy<'a> {
    pub fn new(context: &'a Context, definition: Arc<PolicyDefinition>) -> Self {
        Self {
            context,
            definition,
        }
    }

    pub fn definition(&self) -> &PolicyDefinition {
        &self.definition
    }

    pub fn scope(&self) -> &str {
        self.definition.scope()
    }

    /// Bind this policy to one identifier.
    pub fn action(&self, identifier: impl Into<String>) -> Action<'a> {
        Action {
            context: self.context,
            key: Key::new(self.scope(), identifier),
            definition: self.definition.clone(),
            fail_mode: None,
        }
    }

    /// Effective fail mode for scope-wide operations.
    pub fn fail_mode(&self) -> FailMode {
        FailMode::resolve(
            None,
            None,
            self.definition.fail_mode(),
            self.context.config().default_fail_mode,
        )
    }

    pub async fn tracked_identifiers(&self) -> Result<Vec<String>> {
        let result = self
            .context
            .analyzer()
            .tracked_identifiers(self.scope())
            .await;
        recover(self.fail_mode(), "tracked_identifiers", result, Vec::new)
    }

    pub async fn rate_limited_identifiers(&self) -> Result<Vec<String>> {
        let result = self
            .context
            .analyzer()
            .rate_limited_identifiers(self.scope())
            .await;
        recover(self.fail_mode(), "rate_limited_identifiers", result, Vec::new)
    }

    /// Clear history and blocks for every identifier in the scope.
    pub async fn unblock_all(&self) -> Result<()> {
        let result = self
            .context
            .store()
            .delete_rate_limited_keys(self.scope())
            .await;
        if result.is_ok() {
            info!(scope = %self.scope(), "Unblocked all identifiers");
        }
        recover(self.fail_mode(), "unblock_all", result, || ())
    }

    /// Clear the administrative disable flag. Blocking decisions are unaffected.
    pub async fn enable(&self) -> Result<()> {
        let result = self.context.store().enable(self.scope()).await;
        if result.is_ok() {
            info!(scope = %self.scope(), "Scope enabled");
        }
        recover(self.fail_mode(), "enable", result, || ())
    }

    /// Set the administrative disable flag. Blocking decisions are unaffected.
    pub async fn disable(&self) -> Result<()> {
        let result = self.context.store().disable(self.scope()).await;
        if result.is_ok() {
            info!(scope = %self.scope(), "Scope disabled");
        }
        recover(self.fail_mode(), "disable", result, || ())
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        let result = self.context.store().is_enabled(self.scope()).await;
        recover(self.fail_mode(), "is_enabled", result, || true)
    }

    pub async fn is_disabled(&self) -> Result<bool> {
        Ok(!self.is_enabled().await?)
    }
}

/// A policy applied to one identifier.
#[derive(Debug, Clone)]
pub struct Action<'a> {
    context: &'a Context,
    key: Key,
    definition: Arc<PolicyDefinition>,
    fail_mode: Option<FailMode>,
}

impl<'a> Action<'a> {
    /// Override the policy's fail mode for this action.
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = Some(fail_mode);
        self
    }

    pub fn fail_open(self) -> Self {
        self.with_fail_mode(FailMode::Open)
    }

    pub fn fail_closed(self) -> Self {
        self.with_fail_mode(FailMode::Closed)
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn identifier(&self) -> &str {
        &self.key.identifier
    }

    pub fn checks(&self) -> &[PeriodCheck] {
        self.definition.checks()
    }

    /// Effective fail mode, given an optional per-call override.
    pub fn fail_mode(&self, call: Option<FailMode>) -> FailMode {
        FailMode::resolve(
            call,
            self.fail_mode,
            self.definition.fail_mode(),
            self.context.config().default_fail_mode,
        )
    }

    /// Record one event now.
    pub async fn record_event(&self) -> Result<()> {
        self.record(Event::new()).await
    }

    pub async fn record(&self, event: Event) -> Result<()> {
        let analyzer = self.context.analyzer();
        let timestamp = event.timestamp.unwrap_or_else(|| analyzer.now());
        let result = analyzer.increment(&self.key, timestamp, event.count).await;
        recover(self.fail_mode(event.fail_mode), "record", result, || ())
    }

    /// Whether the identifier may proceed.
    ///
    /// False when a block is in place or when any check is violated now (which
    /// also sets the block). If the store is unavailable, failing open allows
    /// and failing closed denies.
    pub async fn is_allowed(&self) -> Result<bool> {
        self.is_allowed_with(None).await
    }

    pub async fn is_allowed_with(&self, fail_mode: Option<FailMode>) -> Result<bool> {
        match self.evaluate().await {
            Err(err) if err.is_store_unavailable() => {
                let mode = self.fail_mode(fail_mode);
                warn!(
                    key = %self.key,
                    error = %err,
                    fail_mode = ?mode,
                    "Store unavailable while checking rate limit"
                );
                Ok(mode.is_open())
            }
            other => other,
        }
    }

    pub async fn is_rate_limited(&self) -> Result<bool> {
        Ok(!self.is_allowed().await?)
    }

    /// Evaluate the checks and return the violated one, if any.
    pub async fn analyze(&self) -> Result<Option<PeriodCheck>> {
        self.analyze_with(None).await
    }

    pub async fn analyze_with(&self, fail_mode: Option<FailMode>) -> Result<Option<PeriodCheck>> {
        let result = self
            .context
            .analyzer()
            .check(&self.key, &self.definition)
            .await;
        recover(self.fail_mode(fail_mode), "analyze", result, || None)
    }

    /// Clear history and any block for this identifier.
    pub async fn unblock(&self) -> Result<()> {
        let result = self.context.store().delete_key(&self.key).await;
        if result.is_ok() {
            info!(key = %self.key, "Unblocked");
        }
        recover(self.fail_mode(None), "unblock", result, || ())
    }

    /// Seconds left on the current block, `None` when not blocked.
    pub async fn block_ttl(&self) -> Result<Option<u64>> {
        let result = self.context.store().block_ttl(&self.key).await;
        recover(self.fail_mode(None), "block_ttl", result, || None)
    }

    async fn evaluate(&self) -> Result<bool> {
        if self.context.store().is_rate_limited(&self.key).await? {
            return Ok(false);
        }
        let violated = self
            .context
            .analyzer()
            .check(&self.key, &self.definition)
            .await?;
        Ok(violated.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BucketConfig, FloodgateConfig};
    use crate::ratelimit::PolicyRegistry;
    use crate::store::{BucketStore, KeySpace, MemoryStore};

    const START: i64 = 1_000;

    struct Harness {
        context: Context,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(default_fail_mode: FailMode) -> Harness {
        let clock = Arc::new(ManualClock::new(START));
        let buckets = BucketConfig::new(10, 30).unwrap();
        let store = Arc::new(MemoryStore::with_clock(
            buckets,
            KeySpace::default(),
            clock.clone(),
        ));

        let mut registry = PolicyRegistry::new();
        registry
            .register(
                PolicyDefinition::builder("comments")
                    .check(60, 3, 300)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                PolicyDefinition::builder("search")
                    .check(60, 3, 300)
                    .fail_open()
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let config = FloodgateConfig {
            buckets,
            default_fail_mode,
            ..FloodgateConfig::default()
        };
        let context = Context::with_clock(config, store.clone(), registry, clock.clone());

        Harness {
            context,
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn test_blocks_after_exceeding_threshold() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();

        for _ in 0..4 {
            action.record_event().await.unwrap();
            h.clock.advance(2);
        }

        assert!(!action.is_allowed().await.unwrap());
        assert!(action.is_rate_limited().await.unwrap());
        assert_eq!(action.analyze().await.unwrap(), Some(PeriodCheck::new(60, 3, 300)));
    }

    #[tokio::test]
    async fn test_allows_at_threshold() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();

        action.record(Event::new().count(3)).await.unwrap();

        assert!(action.is_allowed().await.unwrap());
        assert_eq!(action.analyze().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counts_accumulate_within_bucket() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();

        action.record(Event::new().count(2).at(START)).await.unwrap();
        action.record(Event::new().count(5).at(START + 9)).await.unwrap();

        let history = h.store.key_history(action.key()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].count, 7);
    }

    #[tokio::test]
    async fn test_old_events_fall_outside_window() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();

        action.record(Event::new().count(10).at(START - 70)).await.unwrap();
        action.record(Event::new().count(2)).await.unwrap();

        assert!(action.is_allowed().await.unwrap());
    }

    #[tokio::test]
    async fn test_block_outlives_history_until_ttl() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();

        action.record(Event::new().count(4)).await.unwrap();
        assert!(!action.is_allowed().await.unwrap());
        assert_eq!(action.block_ttl().await.unwrap(), Some(300));

        // History expires after 30 seconds, the block does not
        h.clock.advance(31);
        assert!(h.store.key_history(action.key()).await.unwrap().is_empty());
        assert!(!action.is_allowed().await.unwrap());

        h.clock.advance(269);
        assert!(action.is_allowed().await.unwrap());
        assert_eq!(action.block_ttl().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unblock() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();

        action.record(Event::new().count(4)).await.unwrap();
        assert!(!action.is_allowed().await.unwrap());

        action.unblock().await.unwrap();
        assert!(action.is_allowed().await.unwrap());
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let h = harness(FailMode::Closed);
        let noisy = h.context.action("comments", "noisy").unwrap();
        let quiet = h.context.action("comments", "quiet").unwrap();

        noisy.record(Event::new().count(4)).await.unwrap();
        quiet.record_event().await.unwrap();

        assert!(!noisy.is_allowed().await.unwrap());
        assert!(quiet.is_allowed().await.unwrap());
    }

    #[tokio::test]
    async fn test_scope_operations() {
        let h = harness(FailMode::Closed);
        let policy = h.context.policy("comments").unwrap();

        policy.action("a").record_event().await.unwrap();
        policy.action("b").record(Event::new().count(4)).await.unwrap();
        assert!(!policy.action("b").is_allowed().await.unwrap());

        assert_eq!(policy.tracked_identifiers().await.unwrap(), vec!["a", "b"]);
        assert_eq!(policy.rate_limited_identifiers().await.unwrap(), vec!["b"]);

        policy.unblock_all().await.unwrap();
        assert!(policy.tracked_identifiers().await.unwrap().is_empty());
        assert!(policy.rate_limited_identifiers().await.unwrap().is_empty());
        assert!(policy.action("b").is_allowed().await.unwrap());
    }

    #[tokio::test]
    async fn test_disable_enable_roundtrip() {
        let h = harness(FailMode::Closed);
        let policy = h.context.policy("comments").unwrap();

        policy.disable().await.unwrap();
        assert!(policy.is_disabled().await.unwrap());
        assert!(!policy.is_enabled().await.unwrap());

        policy.enable().await.unwrap();
        assert!(policy.is_enabled().await.unwrap());
        assert!(!policy.is_disabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_scope_still_blocks() {
        let h = harness(FailMode::Closed);
        let policy = h.context.policy("comments").unwrap();
        let action = policy.action("x");

        policy.disable().await.unwrap();
        action.record(Event::new().count(4)).await.unwrap();

        assert!(!action.is_allowed().await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_open_under_outage() {
        let h = harness(FailMode::Closed);
        let policy = h.context.policy("search").unwrap();
        let action = policy.action("x");
        h.store.simulate_outage("connection refused");

        assert!(action.record_event().await.is_ok());
        assert!(action.is_allowed().await.unwrap());
        assert!(!action.is_rate_limited().await.unwrap());
        assert_eq!(action.analyze().await.unwrap(), None);
        assert!(action.unblock().await.is_ok());
        assert_eq!(action.block_ttl().await.unwrap(), None);

        assert!(policy.tracked_identifiers().await.unwrap().is_empty());
        assert!(policy.rate_limited_identifiers().await.unwrap().is_empty());
        assert!(policy.unblock_all().await.is_ok());
        assert!(policy.disable().await.is_ok());
        assert!(policy.enable().await.is_ok());
        assert!(policy.is_enabled().await.unwrap());
        assert!(!policy.is_disabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_closed_under_outage() {
        let h = harness(FailMode::Closed);
        let policy = h.context.policy("comments").unwrap();
        let action = policy.action("x");
        h.store.simulate_outage("connection refused");

        // Allow queries deny instead of erroring
        assert!(!action.is_allowed().await.unwrap());
        assert!(action.is_rate_limited().await.unwrap());

        assert!(action.record_event().await.unwrap_err().is_store_unavailable());
        assert!(action.analyze().await.unwrap_err().is_store_unavailable());
        assert!(action.unblock().await.unwrap_err().is_store_unavailable());
        assert!(policy.tracked_identifiers().await.unwrap_err().is_store_unavailable());
        assert!(policy.rate_limited_identifiers().await.unwrap_err().is_store_unavailable());
        assert!(policy.unblock_all().await.unwrap_err().is_store_unavailable());
        assert!(policy.disable().await.unwrap_err().is_store_unavailable());
        assert!(policy.enable().await.unwrap_err().is_store_unavailable());
        assert!(policy.is_enabled().await.unwrap_err().is_store_unavailable());
        assert!(policy.is_disabled().await.unwrap_err().is_store_unavailable());
    }

    #[tokio::test]
    async fn test_instance_override_beats_policy() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("search", "x").unwrap().fail_closed();
        h.store.simulate_outage("down");

        assert!(action.record_event().await.is_err());
        assert!(!action.is_allowed().await.unwrap());
    }

    #[tokio::test]
    async fn test_call_override_beats_instance() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();
        h.store.simulate_outage("down");

        assert!(action
            .record(Event::new().fail_mode(FailMode::Open))
            .await
            .is_ok());
        assert!(action.is_allowed_with(Some(FailMode::Open)).await.unwrap());
        assert_eq!(action.analyze_with(Some(FailMode::Open)).await.unwrap(), None);

        let open = action.clone().fail_open();
        assert!(open.record(Event::new().fail_mode(FailMode::Closed)).await.is_err());
    }

    #[tokio::test]
    async fn test_global_default_applies_without_policy_mode() {
        let h = harness(FailMode::Open);
        let action = h.context.action("comments", "x").unwrap();
        h.store.simulate_outage("down");

        assert_eq!(action.fail_mode(None), FailMode::Open);
        assert!(action.record_event().await.is_ok());
        assert!(action.is_allowed().await.unwrap());
    }

    #[tokio::test]
    async fn test_recovers_after_outage() {
        let h = harness(FailMode::Closed);
        let action = h.context.action("comments", "x").unwrap();

        h.store.simulate_outage("down");
        assert!(action.record_event().await.is_err());

        h.store.restore();
        action.record(Event::new().count(4)).await.unwrap();
        assert!(!action.is_allowed().await.unwrap());
    }
}
