//! Counter store contract backing the sliding-window rate limiter
//!
//! The store is the distributed clock and ledger for rate windows: per key it
//! holds a time-ordered set of entries with an expiry. Admission is a single
//! combined purge/check/append operation so that two concurrent callers can
//! never both be admitted into the last remaining slot.

mod memory;

#[cfg(feature = "redis-store")]
mod redis;

pub use memory::MemoryCounterStore;

#[cfg(feature = "redis-store")]
pub use self::redis::RedisCounterStore;

use crate::error::GateResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of ceiling a rate window enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeilingKind {
    /// Requests per minute
    Rpm,
    /// Tokens per minute
    Tpm,
    /// Requests per day
    Rpd,
}

impl CeilingKind {
    /// Trailing window length for this ceiling
    pub fn period(&self) -> Duration {
        match self {
            Self::Rpm | Self::Tpm => Duration::from_secs(60),
            Self::Rpd => Duration::from_secs(86_400),
        }
    }

    /// Stable lowercase name, used as the counter-store key suffix
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::Tpm => "tpm",
            Self::Rpd => "rpd",
        }
    }
}

impl std::fmt::Display for CeilingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// What a window check measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Entry count against the limit (RPM, RPD)
    Count,
    /// Sum of entry costs plus this request's cost against the limit (TPM)
    Cost(u64),
}

/// One window to evaluate inside a combined admission check
#[derive(Debug, Clone)]
pub struct WindowCheck {
    /// Counter-store key for the window
    pub key: String,
    /// Ceiling kind, reported back on rejection
    pub kind: CeilingKind,
    /// Trailing window length
    pub period: Duration,
    /// Configured ceiling
    pub limit: u64,
    /// Count or cost-sum comparison
    pub probe: Probe,
}

impl WindowCheck {
    /// Count-based check (RPM, RPD)
    pub fn count(key: impl Into<String>, kind: CeilingKind, limit: u64) -> Self {
        Self {
            key: key.into(),
            kind,
            period: kind.period(),
            limit,
            probe: Probe::Count,
        }
    }

    /// Cost-sum check (TPM)
    pub fn cost(key: impl Into<String>, kind: CeilingKind, limit: u64, cost: u64) -> Self {
        Self {
            key: key.into(),
            kind,
            period: kind.period(),
            limit,
            probe: Probe::Cost(cost),
        }
    }
}

/// Outcome of a combined admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Every window had room; one entry was appended per window
    Admitted,
    /// One window was full; nothing was recorded anywhere
    Rejected {
        /// The breached ceiling
        kind: CeilingKind,
        /// Observed usage at rejection time (including this request for cost probes)
        current: u64,
        /// The configured ceiling
        limit: u64,
        /// Time until the oldest entry of the breached window expires
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the request was admitted
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Treat a rejection as an error
    ///
    /// The manager consumes rejections as try-next values; embedders driving
    /// a limiter directly can surface them as [`GateError::RateLimited`].
    pub fn into_result(self) -> Result<(), crate::error::GateError> {
        match self {
            Self::Admitted => Ok(()),
            Self::Rejected {
                kind, retry_after, ..
            } => Err(crate::error::GateError::RateLimited { kind, retry_after }),
        }
    }
}

/// Shared, atomic key-value/sorted-set service with per-entry expiry
///
/// Implementations must make `check_and_append` effectively atomic per call:
/// either every window gains one entry, or none does. Two concurrent callers
/// must not both observe "under limit" when only one slot remains. The
/// read-side operations (`entry_count`, `cost_sum`) never mutate a window so
/// that statistics stay side-effect free.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Purge expired entries, evaluate every window, and either append one
    /// entry to each window (admitted) or record nothing (rejected)
    async fn check_and_append(&self, checks: &[WindowCheck]) -> GateResult<Admission>;

    /// Append one cost-tagged entry without an admission check
    ///
    /// Used for post-hoc cost corrections; `cost` may be negative.
    async fn append(&self, key: &str, cost: i64, period: Duration) -> GateResult<()>;

    /// Number of non-expired entries under `key`
    async fn entry_count(&self, key: &str, period: Duration) -> GateResult<u64>;

    /// Sum of non-expired entry costs under `key` (may be negative)
    async fn cost_sum(&self, key: &str, period: Duration) -> GateResult<i64>;

    /// Remove the given keys entirely
    async fn clear(&self, keys: &[String]) -> GateResult<()>;
}
