//! Configuration management for Turnstile.
//!
//! Settings are read from an optional YAML file and then overridden by
//! environment variables prefixed with `TURNSTILE__`, using `__` between
//! nested keys (e.g. `TURNSTILE__LIMITER__LOCK_SHARDS=128`).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::locks::DEFAULT_LOCK_SHARDS;

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Key naming
    #[serde(default)]
    pub keys: KeyConfig,

    /// Limiter tuning
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Path to the rate limit policy file
    #[serde(default)]
    pub policy_path: Option<String>,

    /// Logging output
    #[serde(default)]
    pub log: LogConfig,
}

/// Names used to build store keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Global prefix shared by every key, for stores used by several apps
    #[serde(default)]
    pub application_name: String,

    /// Suffix for throttle counter keys
    #[serde(default = "default_throttle_key")]
    pub throttle_key: String,

    /// Suffix for the policy key
    #[serde(default = "default_policy_key")]
    pub policy_key: String,
}

impl KeyConfig {
    /// Prefix for throttle counter keys.
    pub fn throttle_prefix(&self) -> String {
        format!("{}{}", self.application_name, self.throttle_key)
    }

    /// Key under which the active policy is stored.
    pub fn policy_key(&self) -> String {
        format!("{}{}", self.application_name, self.policy_key)
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            throttle_key: default_throttle_key(),
            policy_key: default_policy_key(),
        }
    }
}

fn default_throttle_key() -> String {
    "throttle".to_string()
}

fn default_policy_key() -> String {
    "throttle_policy".to_string()
}

/// Limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Lock shards for stores without an atomic increment; 1 means one global lock
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            lock_shards: default_lock_shards(),
        }
    }
}

fn default_lock_shards() -> usize {
    DEFAULT_LOCK_SHARDS
}

/// Counter store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
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

impl TurnstileConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration from a YAML file, with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(TurnstileError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<TurnstileConfig>()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.lock_shards == 0 {
            return Err(TurnstileError::Config("limiter.lock_shards must be at least 1".into()));
        }
        if self.keys.throttle_key.is_empty() {
            return Err(TurnstileError::Config("keys.throttle_key must not be empty".into()));
        }
        Ok(())
    }
}
