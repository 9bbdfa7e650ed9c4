//! Per-key threshold overrides.
//!
//! Rules are matched most specific first: an API key + route entry wins over
//! an API key entry, which wins over a route entry, which wins over the
//! defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::counter::Thresholds;
use super::descriptor::RateLimitKey;
use crate::error::{BurstguardError, Result};

/// A complete set of threshold rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdRules {
    /// Thresholds for keys no rule matches
    #[serde(default)]
    pub defaults: Thresholds,
    /// Rules that apply to a route for every API key
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    /// Rules scoped to a single API key
    #[serde(default)]
    pub api_keys: Vec<ApiKeyRule>,
}

/// Thresholds for a single route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub route: String,
    pub limits: Thresholds,
}

/// Thresholds for an API key, optionally refined per route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRule {
    /// The API key to match
    pub api_key: String,
    /// Thresholds for every route of this key (falls through when absent)
    #[serde(default)]
    pub limits: Option<Thresholds>,
    /// Route-specific thresholds for this key
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl ThresholdRules {
    /// Create rules that apply `defaults` to every key.
    pub fn new(defaults: Thresholds) -> Self {
        Self {
            defaults,
            routes: Vec::new(),
            api_keys: Vec::new(),
        }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading threshold rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: ThresholdRules = serde_yaml::from_str(yaml)
            .map_err(|e| BurstguardError::Config(format!("Failed to parse threshold rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Validate every set of thresholds in the rules.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for rule in &self.routes {
            rule.limits.validate()?;
        }
        for rule in &self.api_keys {
            if let Some(limits) = &rule.limits {
                limits.validate()?;
            }
            for route_rule in &rule.routes {
                route_rule.limits.validate()?;
            }
        }
        Ok(())
    }

    /// Find the thresholds that apply to a key.
    pub fn resolve(&self, key: &RateLimitKey) -> Thresholds {
        let key_rule = self.api_keys.iter().find(|r| r.api_key == key.api_key);

        if let Some(rule) = key_rule {
            if let Some(route_rule) = rule.routes.iter().find(|r| r.route == key.route) {
                return route_rule.limits;
            }
            if let Some(limits) = rule.limits {
                return limits;
            }
        }

        if let Some(route_rule) = self.routes.iter().find(|r| r.route == key.route) {
            return route_rule.limits;
        }

        self.defaults
    }
}
