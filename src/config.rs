//! Configuration management for Burstguard.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BurstguardError, Result};
use crate::ratelimit::{ThresholdRules, Thresholds};

/// Prefix for environment overrides, e.g. `BURSTGUARD__LIMITS__LIMIT_PER_SECOND`.
pub const ENV_PREFIX: &str = "BURSTGUARD";

/// Main configuration for Burstguard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BurstguardConfig {
    /// Default thresholds for keys without a rule, overriding the rules
    /// file's `defaults` when set
    #[serde(default)]
    pub limits: Option<Thresholds>,

    /// Path to a YAML file of per-key threshold rules
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Seconds between sweeps of idle keys; trace seconds during replay
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
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

impl BurstguardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BurstguardConfig = serde_yaml::from_str(&contents)
            .map_err(|e| BurstguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file plus environment overrides.
    ///
    /// Environment variables take precedence over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: BurstguardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BurstguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can be enforced.
    pub fn validate(&self) -> Result<()> {
        if let Some(limits) = &self.limits {
            limits.validate()?;
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(BurstguardError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the threshold rules described by this configuration.
    ///
    /// Rules come from `rules_path` when set; `limits`, when set, replaces
    /// their defaults.
    pub fn threshold_rules(&self) -> Result<ThresholdRules> {
        let mut rules = match &self.rules_path {
            Some(path) => ThresholdRules::from_file(path)?,
            None => ThresholdRules::default(),
        };
        if let Some(limits) = self.limits {
            rules.defaults = limits;
        }
        Ok(rules)
    }
}
