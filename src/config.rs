//! Configuration types for roles and their providers
//!
//! Loaded from TOML by an external loader or [`GateConfig::load`]; the core
//! treats the result as already-validated data apart from the hard
//! requirement that a served role has at least one provider.

use crate::error::GateResult;
use crate::provider::{ProviderConfig, RotationStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Whole-process configuration: one entry per logical role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Role name to role configuration
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

impl GateConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> GateResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(raw: &str) -> GateResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Look up one role's configuration
    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.get(name)
    }
}

/// Providers and retry behavior for one logical role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Redundant providers backing this role
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Rotation strategy; unknown names fall back to round-robin
    #[serde(
        default = "default_strategy",
        deserialize_with = "RotationStrategy::deserialize_lossy"
    )]
    pub rotation_strategy: RotationStrategy,
    /// Whether failed calls are retried against other providers
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
    /// Maximum attempts per logical call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in seconds; attempt n waits `retry_delay * n`
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            rotation_strategy: default_strategy(),
            auto_retry: default_auto_retry(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl RoleConfig {
    /// Base backoff delay as a `Duration`
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }
}

fn default_strategy() -> RotationStrategy {
    RotationStrategy::RoundRobin
}

fn default_auto_retry() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}
