//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{FailMode, MAX_SECONDS};

/// Prefix for environment variable overrides (`FLOODGATE__BUCKETS__RESOLUTION_SECS=60`).
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Time bucketing configuration
    #[serde(default)]
    pub buckets: BucketConfig,

    /// Fail mode used when neither the call, the action nor the policy picks one
    #[serde(default)]
    pub default_fail_mode: FailMode,

    /// Path to a YAML file with policy definitions
    #[serde(default)]
    pub policies_path: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db")]
    pub db: u32,

    /// Full connection URL; takes precedence over host, port and db
    #[serde(default)]
    pub url: Option<String>,

    /// Optional prefix applied to every key
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: default_host(),
            port: default_port(),
            db: default_db(),
            url: None,
            namespace: None,
        }
    }
}

impl StoreConfig {
    /// The Redis connection URL for this configuration.
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_db() -> u32 {
    1
}

/// Bucket width and retention.
///
/// Events are aggregated into buckets `resolution_secs` wide; a key keeps at
/// most `history_secs / resolution_secs` buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default = "default_resolution")]
    pub resolution_secs: u64,

    #[serde(default = "default_history")]
    pub history_secs: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            resolution_secs: default_resolution(),
            history_secs: default_history(),
        }
    }
}

fn default_resolution() -> u64 {
    600
}

fn default_history() -> u64 {
    86400
}

impl BucketConfig {
    pub fn new(resolution_secs: u64, history_secs: u64) -> Result<Self> {
        let buckets = Self {
            resolution_secs,
            history_secs,
        };
        buckets.validate()?;
        Ok(buckets)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution_secs == 0 {
            return Err(FloodgateError::Config(
                "resolution_secs must be greater than zero".to_string(),
            ));
        }
        if self.history_secs > MAX_SECONDS {
            return Err(FloodgateError::Config(format!(
                "history_secs ({}) must not exceed {}",
                self.history_secs, MAX_SECONDS
            )));
        }
        if self.history_secs < self.resolution_secs {
            return Err(FloodgateError::Config(format!(
                "history_secs ({}) must be at least resolution_secs ({})",
                self.history_secs, self.resolution_secs
            )));
        }
        Ok(())
    }

    /// Maximum number of buckets retained per key.
    pub fn time_blocks_to_keep(&self) -> usize {
        (self.history_secs / self.resolution_secs) as usize
    }

    /// Start of the bucket containing `timestamp`.
    pub fn bucket_for(&self, timestamp: i64) -> i64 {
        let resolution = self.resolution_secs as i64;
        timestamp.div_euclid(resolution) * resolution
    }
}

/// Logging configuration for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply `FLOODGATE__*`
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.as_ref()).required(true));
        }
        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.buckets.validate()
    }
}
