//! Policy definitions and the scope registry.
//!
//! A policy binds a scope to an ordered list of period checks and an optional
//! fail mode. Definitions are immutable once built; the registry maps scope
//! names to them and can be loaded from YAML:
//!
//! ```yaml
//! policies:
//!   - scope: ipn:follow
//!     fail_mode: open
//!     checks:
//!       - period_seconds: 60
//!         max_allowed: 100
//!         block_ttl: 3600
//!       - period_seconds: 1800
//!         max_allowed: 2000
//!         block_ttl: 3600
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::check::{PeriodCheck, MAX_SECONDS};
use crate::error::{FloodgateError, Result};

/// What to do when the store is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Behave as if nothing is wrong: allow, report success, return nothing.
    Open,
    /// Surface the failure (or deny, for allow queries).
    #[default]
    Closed,
}

impl FailMode {
    pub fn from_fail_open(fail_open: bool) -> Self {
        if fail_open {
            FailMode::Open
        } else {
            FailMode::Closed
        }
    }

    pub fn is_open(self) -> bool {
        self == FailMode::Open
    }

    /// First mode that is set, from most to least specific.
    pub fn resolve(
        call: Option<FailMode>,
        instance: Option<FailMode>,
        policy: Option<FailMode>,
        global: FailMode,
    ) -> FailMode {
        call.or(instance).or(policy).unwrap_or(global)
    }
}

/// The static configuration of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub struct PolicyDefinition {
    scope: String,
    checks: Vec<PeriodCheck>,
    fail_mode: Option<FailMode>,
}

impl PolicyDefinition {
    pub fn builder(scope: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder {
            scope: scope.into(),
            checks: Vec::new(),
            fail_mode: None,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Checks in evaluation order, narrowest period first.
    pub fn checks(&self) -> &[PeriodCheck] {
        &self.checks
    }

    /// The policy's own fail mode, if it declares one.
    pub fn fail_mode(&self) -> Option<FailMode> {
        self.fail_mode
    }
}

/// Builder for [`PolicyDefinition`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    scope: String,
    checks: Vec<PeriodCheck>,
    fail_mode: Option<FailMode>,
}

impl PolicyBuilder {
    /// Block for `block_ttl` seconds once more than `max_allowed` events
    /// happen within `period_seconds`.
    pub fn check(mut self, period_seconds: u64, max_allowed: u64, block_ttl: u64) -> Self {
        self.checks
            .push(PeriodCheck::new(period_seconds, max_allowed, block_ttl));
        self
    }

    pub fn checks(mut self, checks: impl IntoIterator<Item = PeriodCheck>) -> Self {
        self.checks.extend(checks);
        self
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_mode = Some(FailMode::Open);
        self
    }

    pub fn fail_closed(mut self) -> Self {
        self.fail_mode = Some(FailMode::Closed);
        self
    }

    pub fn fail_mode(mut self, fail_mode: Option<FailMode>) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    pub fn build(self) -> Result<PolicyDefinition> {
        if self.scope.is_empty() {
            return Err(FloodgateError::InvalidPolicy(
                "scope must not be empty".to_string(),
            ));
        }
        if self.checks.is_empty() {
            return Err(FloodgateError::InvalidPolicy(format!(
                "scope '{}' declares no checks",
                self.scope
            )));
        }
        for check in &self.checks {
            if check.period_seconds == 0 || check.block_ttl == 0 {
                return Err(FloodgateError::InvalidPolicy(format!(
                    "scope '{}': period_seconds and block_ttl must be positive, got {:?}",
                    self.scope, check
                )));
            }
            if check.period_seconds > MAX_SECONDS || check.block_ttl > MAX_SECONDS {
                return Err(FloodgateError::InvalidPolicy(format!(
                    "scope '{}': period_seconds and block_ttl must not exceed {}, got {:?}",
                    self.scope, MAX_SECONDS, check
                )));
            }
        }

        let mut checks = self.checks;
        checks.sort_by_key(|check| check.period_seconds);

        Ok(PolicyDefinition {
            scope: self.scope,
            checks,
            fail_mode: self.fail_mode,
        })
    }
}

/// Serialized form of a policy, validated on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPolicy {
    scope: String,
    #[serde(default)]
    checks: Vec<PeriodCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fail_mode: Option<FailMode>,
}

impl TryFrom<RawPolicy> for PolicyDefinition {
    type Error = FloodgateError;

    fn try_from(raw: RawPolicy) -> Result<Self> {
        PolicyDefinition::builder(raw.scope)
            .checks(raw.checks)
            .fail_mode(raw.fail_mode)
            .build()
    }
}

impl From<PolicyDefinition> for RawPolicy {
    fn from(policy: PolicyDefinition) -> Self {
        RawPolicy {
            scope: policy.scope,
            checks: policy.checks,
            fail_mode: policy.fail_mode,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    policies: Vec<PolicyDefinition>,
}

/// Every registered policy, by scope.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<PolicyDefinition>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy definitions");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(yaml).map_err(|e| {
            FloodgateError::InvalidPolicy(format!("Failed to parse policies: {}", e))
        })?;

        let mut registry = Self::new();
        for policy in file.policies {
            registry.register(policy)?;
        }
        Ok(registry)
    }

    /// Register a policy. Each scope may be registered once.
    pub fn register(&mut self, policy: PolicyDefinition) -> Result<Arc<PolicyDefinition>> {
        if self.policies.contains_key(policy.scope()) {
            return Err(FloodgateError::InvalidPolicy(format!(
                "scope '{}' is already registered",
                policy.scope()
            )));
        }

        let policy = Arc::new(policy);
        self.policies
            .insert(policy.scope().to_string(), policy.clone());
        Ok(policy)
    }

    pub fn get(&self, scope: &str) -> Result<Arc<PolicyDefinition>> {
        self.policies
            .get(scope)
            .cloned()
            .ok_or_else(|| FloodgateError::UnknownScope(scope.to_string()))
    }

    /// Registered scope names, sorted.
    pub fn scopes(&self) -> Vec<&str> {
        let mut scopes: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        scopes.sort_unstable();
        scopes
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
