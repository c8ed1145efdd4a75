//! Modelgate Core Library
//!
//! Multi-provider admission control and failover for language-model
//! endpoints: per-provider sliding-window rate ceilings, credential rotation,
//! health tracking with cooldown recovery, and a bounded retry/failover loop
//! around every outbound call.

pub mod call;
pub mod config;
pub mod error;
pub mod limiter;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use call::{
    estimate_tokens, CallOptions, CallResponse, FailoverNotifier, LogNotifier, ManagedCaller,
    TokenUsage, Transport,
};
pub use config::{GateConfig, RoleConfig};
pub use error::{GateError, GateResult};
pub use limiter::{CeilingUsage, RateLimiter, RateLimits, UsageStats};
pub use manager::{ProviderManager, ProviderStats};
pub use provider::{HealthPolicy, ProviderConfig, ProviderSnapshot, RotationStrategy};
pub use registry::GateRegistry;
pub use store::{Admission, CeilingKind, CounterStore, MemoryCounterStore, Probe, WindowCheck};

#[cfg(feature = "redis-store")]
pub use store::RedisCounterStore;
