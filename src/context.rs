//! Process-wide rate limiting context.
//!
//! Holds the configuration, the store handle, the clock and the policy
//! registry. Build one per process and hand out [`Policy`] and [`Action`]
//! handles from it.

use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{FloodgateConfig, StoreBackend};
use crate::error::Result;
use crate::ratelimit::{Action, Analyzer, Policy, PolicyRegistry};
use crate::store::{BucketStore, KeySpace, MemoryStore, RedisStore};

pub struct Context {
    config: FloodgateConfig,
    store: Arc<dyn BucketStore>,
    analyzer: Analyzer,
    registry: PolicyRegistry,
}

impl Context {
    /// Build a context with the store backend named in `config`.
    pub async fn connect(config: FloodgateConfig, registry: PolicyRegistry) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn BucketStore> = match config.store.backend {
            StoreBackend::Redis => {
                Arc::new(RedisStore::connect(&config.store, config.buckets).await?)
            }
            StoreBackend::Memory => Arc::new(MemoryStore::with_clock(
                config.buckets,
                KeySpace::new(config.store.namespace.clone()),
                Arc::new(SystemClock),
            )),
        };

        info!(
            backend = ?config.store.backend,
            resolution_secs = config.buckets.resolution_secs,
            history_secs = config.buckets.history_secs,
            policies = registry.len(),
            "Rate limiting context ready"
        );

        Ok(Self::new(config, store, registry))
    }

    /// Build a context around an existing store, using the system clock.
    pub fn new(
        config: FloodgateConfig,
        store: Arc<dyn BucketStore>,
        registry: PolicyRegistry,
    ) -> Self {
        Self::with_clock(config, store, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: FloodgateConfig,
        store: Arc<dyn BucketStore>,
        registry: PolicyRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let analyzer = Analyzer::new(store.clone(), clock);
        Self {
            config,
            store,
            analyzer,
            registry,
        }
    }

    pub fn config(&self) -> &FloodgateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// The registered policy for `scope`.
    pub fn policy(&self, scope: &str) -> Result<Policy<'_>> {
        Ok(Policy::new(self, self.registry.get(scope)?))
    }

    /// The registered policy for `scope`, applied to `identifier`.
    pub fn action(&self, scope: &str, identifier: impl Into<String>) -> Result<Action<'_>> {
        Ok(self.policy(scope)?.action(identifier))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("analyzer", &self.analyzer)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloodgateError;
    use crate::ratelimit::PolicyDefinition;

    fn registry() -> PolicyRegistry {
        let mut registry = PolicyRegistry::new();
        registry
            .register(
                PolicyDefinition::builder("login")
                    .check(60, 5, 300)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = FloodgateConfig::from_yaml("store:\n  backend: memory\n").unwrap();
        let context = Context::connect(config, registry()).await.unwrap();

        let action = context.action("login", "alice").unwrap();
        action.record_event().await.unwrap();
        assert!(action.is_allowed().await.unwrap());

        let tracked = context
            .policy("login")
            .unwrap()
            .tracked_identifiers()
            .await
            .unwrap();
        assert_eq!(tracked, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_unknown_scope_is_an_error() {
        let config = FloodgateConfig::from_yaml("store:\n  backend: memory\n").unwrap();
        let context = Context::connect(config, registry()).await.unwrap();

        assert!(matches!(
            context.action("signup", "alice"),
            Err(FloodgateError::UnknownScope(_))
        ));
    }
}
