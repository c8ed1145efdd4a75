//! Provider records, identity, and health tracking

use crate::limiter::RateLimits;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// How a manager rotates across its providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    /// Circular order driven by a shared cursor
    RoundRobin,
    /// Ascending by total requests, ties broken by priority
    LeastUsed,
    /// Uniform shuffle per call
    Random,
}

impl RotationStrategy {
    /// Parse a strategy name, falling back to round-robin on unknown input
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "round-robin" => Self::RoundRobin,
            "least-used" => Self::LeastUsed,
            "random" => Self::Random,
            other => {
                warn!(strategy = other, "unknown rotation strategy, using round-robin");
                Self::RoundRobin
            }
        }
    }

    /// Strategy name as configured
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastUsed => "least-used",
            Self::Random => "random",
        }
    }

    /// Serde helper: deserialize a strategy string with the lossy fallback
    pub fn deserialize_lossy<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::parse_lossy(&value))
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One endpoint/credential/model combination with its own ceilings
///
/// `Debug` redacts the credential; the derived identifier, not the raw
/// credential, is what reaches logs and counter-store keys.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Human-readable provider name
    pub name: String,
    /// API credential for the endpoint
    pub credential: String,
    /// Model identifier to request
    pub model: String,
    /// Endpoint base URL
    pub endpoint: String,
    /// Ascending priority; lower values are tried first
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Maximum requests per minute
    #[serde(default)]
    pub rpm: Option<u64>,
    /// Maximum tokens per minute
    #[serde(default)]
    pub tpm: Option<u64>,
    /// Maximum requests per day
    #[serde(default)]
    pub rpd: Option<u64>,
    /// Whether the provider participates in selection
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    /// Stable identifier: first 16 hex chars of SHA-256 over `name:credential`
    pub fn identifier(&self) -> String {
        let digest = Sha256::digest(format!("{}:{}", self.name, self.credential).as_bytes());
        digest.iter().take(8).fold(String::with_capacity(16), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
    }

    /// Configured ceilings as a limiter input
    pub fn limits(&self) -> RateLimits {
        RateLimits {
            rpm: self.rpm,
            tpm: self.tpm,
            rpd: self.rpd,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("credential", &"<redacted>")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("priority", &self.priority)
            .field("rpm", &self.rpm)
            .field("tpm", &self.tpm)
            .field("rpd", &self.rpd)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Immutable view of a selected provider handed to callers
///
/// Carries everything the transport needs; health fields stay with the
/// manager and are never exposed here.
#[derive(Clone)]
pub struct ProviderSnapshot {
    /// Provider name
    pub name: String,
    /// Derived stable identifier
    pub identifier: String,
    /// API credential for the call
    pub credential: String,
    /// Model identifier
    pub model: String,
    /// Endpoint base URL
    pub endpoint: String,
    /// Configured priority
    pub priority: u32,
}

impl fmt::Debug for ProviderSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSnapshot")
            .field("name", &self.name)
            .field("identifier", &self.identifier)
            .field("credential", &"<redacted>")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Failure threshold and cooldown governing provider health
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Consecutive-failure count that marks a provider unhealthy
    pub failure_threshold: u32,
    /// Minimum elapsed time before an unhealthy provider is reconsidered
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Runtime health counters for one provider, owned by its manager
#[derive(Debug, Default)]
pub struct HealthState {
    pub(crate) failure_count: u32,
    pub(crate) last_failure: Option<Instant>,
    pub(crate) total_requests: u64,
}

impl HealthState {
    /// Record a successful request; success slowly pays down failures
    pub fn record_success(&mut self) {
        self.total_requests += 1;
        self.failure_count = self.failure_count.saturating_sub(1);
    }

    /// Record a failed request
    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
    }

    /// Evaluate health, lazily resetting the failure count once the cooldown
    /// has elapsed since the last failure
    pub fn check(&mut self, policy: &HealthPolicy) -> bool {
        if self.failure_count >= policy.failure_threshold {
            if let Some(last) = self.last_failure {
                if last.elapsed() < policy.cooldown {
                    return false;
                }
            }
            self.failure_count = 0;
        }
        true
    }
}
