//! Error types for the admission-control core

use crate::store::CeilingKind;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for admission-control operations
pub type GateResult<T> = Result<T, GateError>;

/// Main error type for the admission-control core
#[derive(Error, Debug, Clone)]
pub enum GateError {
    /// Configuration related errors; fatal, raised at construction and never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// One ceiling breached for one provider; recoverable by trying another
    /// provider or waiting out `retry_after`
    #[error("{kind} limit exceeded, retry after {:.2}s", .retry_after.as_secs_f64())]
    RateLimited {
        kind: CeilingKind,
        retry_after: Duration,
    },

    /// Transport, auth, or model failure from a specific provider
    #[error("Provider {provider} call failed: {message}")]
    ProviderCall { provider: String, message: String },

    /// No provider admitted the request after exhausting healthy candidates
    #[error("Providers exhausted: {0}")]
    Exhausted(String),

    /// Overall call deadline hit; in-flight work is abandoned
    #[error("Call timed out after {:.1}s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),
}

impl GateError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new provider call error
    pub fn provider_call(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderCall {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a new exhaustion error
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::Exhausted(message.into())
    }

    /// Create a new counter store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Whether another provider or a later retry may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ProviderCall { .. } | Self::Exhausted(_)
        )
    }
}

impl From<std::io::Error> for GateError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

impl From<toml::de::Error> for GateError {
    fn from(error: toml::de::Error) -> Self {
        Self::Config(error.to_string())
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for GateError {
    fn from(error: redis::RedisError) -> Self {
        Self::Store(error.to_string())
    }
}
