//! Sliding-window rate limiter for provider admission
//!
//! One limiter guards one provider identifier against up to three ceilings:
//! requests per minute, tokens per minute, and requests per day. All counting
//! happens in the shared [`CounterStore`], so every process pointed at the
//! same store observes the same windows.

use crate::error::GateResult;
use crate::store::{Admission, CeilingKind, CounterStore, WindowCheck};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Optional ceilings for one provider identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Maximum requests per minute
    pub rpm: Option<u64>,
    /// Maximum tokens per minute
    pub tpm: Option<u64>,
    /// Maximum requests per day
    pub rpd: Option<u64>,
}

impl RateLimits {
    /// Whether no ceiling is configured at all
    pub fn is_unlimited(&self) -> bool {
        self.rpm.is_none() && self.tpm.is_none() && self.rpd.is_none()
    }
}

/// Current usage of one configured ceiling
#[derive(Debug, Clone, Serialize)]
pub struct CeilingUsage {
    /// Which ceiling
    pub kind: CeilingKind,
    /// Configured limit
    pub limit: u64,
    /// Non-expired count or cost sum (never negative)
    pub current: u64,
    /// `current` as a percentage of `limit`
    pub percent: f64,
}

/// Read-only usage snapshot for one identifier
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    /// The identifier the windows belong to
    pub identifier: String,
    /// One entry per configured ceiling
    pub ceilings: Vec<CeilingUsage>,
}

/// Per-identifier sliding-window admission control
#[derive(Clone)]
pub struct RateLimiter {
    identifier: String,
    limits: RateLimits,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Create a limiter for one identifier over the given store
    pub fn new(
        identifier: impl Into<String>,
        limits: RateLimits,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            limits,
            store,
        }
    }

    /// The identifier whose windows this limiter owns
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Configured ceilings
    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    fn key(&self, kind: CeilingKind) -> String {
        format!("rate_limit:{}:{}", self.identifier, kind.as_str())
    }

    /// Admit or reject one request against every configured ceiling
    ///
    /// On admission one entry is appended per applicable window; on rejection
    /// nothing is recorded. The limit-th request is the last one admitted.
    /// TPM is only consulted when `estimated_cost` is non-zero.
    pub async fn check_and_increment(&self, estimated_cost: u64) -> GateResult<Admission> {
        let mut checks = Vec::with_capacity(3);
        if let Some(rpm) = self.limits.rpm {
            checks.push(WindowCheck::count(self.key(CeilingKind::Rpm), CeilingKind::Rpm, rpm));
        }
        if let Some(tpm) = self.limits.tpm {
            if estimated_cost > 0 {
                checks.push(WindowCheck::cost(
                    self.key(CeilingKind::Tpm),
                    CeilingKind::Tpm,
                    tpm,
                    estimated_cost,
                ));
            }
        }
        if let Some(rpd) = self.limits.rpd {
            checks.push(WindowCheck::count(self.key(CeilingKind::Rpd), CeilingKind::Rpd, rpd));
        }

        if checks.is_empty() {
            return Ok(Admission::Admitted);
        }

        let outcome = self.store.check_and_append(&checks).await?;
        match &outcome {
            Admission::Admitted => {
                debug!(identifier = %self.identifier, estimated_cost, "request admitted");
            }
            Admission::Rejected {
                kind,
                current,
                limit,
                retry_after,
            } => {
                warn!(
                    identifier = %self.identifier,
                    kind = %kind,
                    current,
                    limit,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "rate limit exceeded"
                );
            }
        }
        Ok(outcome)
    }

    /// Reconcile the TPM window once the true token cost is known
    ///
    /// Posts a correction entry of `actual - estimated` so future checks see
    /// real usage instead of waiting out the original estimate's expiry.
    pub async fn record_actual_cost(&self, actual: u64, estimated: u64) -> GateResult<()> {
        if self.limits.tpm.is_none() || actual == estimated {
            return Ok(());
        }
        let adjustment = actual as i64 - estimated as i64;
        self.store
            .append(&self.key(CeilingKind::Tpm), adjustment, CeilingKind::Tpm.period())
            .await?;
        debug!(identifier = %self.identifier, adjustment, "reconciled token usage");
        Ok(())
    }

    /// Read-only usage snapshot; never mutates any window
    pub async fn usage_stats(&self) -> GateResult<UsageStats> {
        let mut ceilings = Vec::new();

        if let Some(limit) = self.limits.rpm {
            let current = self
                .store
                .entry_count(&self.key(CeilingKind::Rpm), CeilingKind::Rpm.period())
                .await?;
            ceilings.push(ceiling_usage(CeilingKind::Rpm, limit, current));
        }
        if let Some(limit) = self.limits.tpm {
            let sum = self
                .store
                .cost_sum(&self.key(CeilingKind::Tpm), CeilingKind::Tpm.period())
                .await?;
            ceilings.push(ceiling_usage(CeilingKind::Tpm, limit, sum.max(0) as u64));
        }
        if let Some(limit) = self.limits.rpd {
            let current = self
                .store
                .entry_count(&self.key(CeilingKind::Rpd), CeilingKind::Rpd.period())
                .await?;
            ceilings.push(ceiling_usage(CeilingKind::Rpd, limit, current));
        }

        Ok(UsageStats {
            identifier: self.identifier.clone(),
            ceilings,
        })
    }

    /// Clear every window of this identifier
    pub async fn reset(&self) -> GateResult<()> {
        let keys = vec![
            self.key(CeilingKind::Rpm),
            self.key(CeilingKind::Tpm),
            self.key(CeilingKind::Rpd),
        ];
        self.store.clear(&keys).await?;
        info!(identifier = %self.identifier, "rate limiter reset");
        Ok(())
    }
}

fn ceiling_usage(kind: CeilingKind, limit: u64, current: u64) -> CeilingUsage {
    let percent = if limit == 0 {
        0.0
    } else {
        current as f64 / limit as f64 * 100.0
    };
    CeilingUsage {
        kind,
        limit,
        current,
        percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;
    use std::time::Duration;

    fn limiter(limits: RateLimits) -> RateLimiter {
        RateLimiter::new("test-id", limits, Arc::new(MemoryCounterStore::new()))
    }

    fn rpm(limit: u64) -> RateLimits {
        RateLimits {
            rpm: Some(limit),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_exactly_the_limit_plus_one_th_request() {
        let limiter = limiter(rpm(5));

        for _ in 0..5 {
            assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
        }

        match limiter.check_and_increment(0).await.unwrap() {
            Admission::Rejected { kind, retry_after, .. } => {
                assert_eq!(kind, CeilingKind::Rpm);
                assert!(retry_after <= Duration::from_secs(60));
            }
            Admission::Admitted => panic!("sixth request must be rejected"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_restores_capacity() {
        let limiter = limiter(rpm(2));

        assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
        assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
        assert!(!limiter.check_and_increment(0).await.unwrap().is_admitted());

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
        assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
        assert!(!limiter.check_and_increment(0).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn tpm_reconciliation_frees_capacity() {
        let limiter = limiter(RateLimits {
            tpm: Some(1000),
            ..Default::default()
        });

        assert!(limiter.check_and_increment(800).await.unwrap().is_admitted());
        // 800 + 300 > 1000
        assert!(!limiter.check_and_increment(300).await.unwrap().is_admitted());

        // Actual usage was only 500, so 500 + 300 <= 1000 afterwards.
        limiter.record_actual_cost(500, 800).await.unwrap();
        assert!(limiter.check_and_increment(300).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn zero_cost_skips_tpm() {
        let limiter = limiter(RateLimits {
            tpm: Some(1),
            ..Default::default()
        });

        // Cost-free probes never consult the token window.
        for _ in 0..10 {
            assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
        }
    }

    #[tokio::test]
    async fn unlimited_kind_always_admits() {
        let limiter = limiter(RateLimits::default());
        assert!(limiter.limits().is_unlimited());

        for _ in 0..100 {
            assert!(limiter.check_and_increment(50).await.unwrap().is_admitted());
        }
    }

    #[tokio::test]
    async fn usage_stats_are_read_only() {
        let limiter = limiter(rpm(10));
        limiter.check_and_increment(0).await.unwrap();
        limiter.check_and_increment(0).await.unwrap();

        for _ in 0..5 {
            let stats = limiter.usage_stats().await.unwrap();
            assert_eq!(stats.ceilings.len(), 1);
            assert_eq!(stats.ceilings[0].current, 2);
            assert_eq!(stats.ceilings[0].limit, 10);
            assert!((stats.ceilings[0].percent - 20.0).abs() < f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn reported_usage_never_negative() {
        let limiter = limiter(RateLimits {
            tpm: Some(1000),
            ..Default::default()
        });

        limiter.check_and_increment(100).await.unwrap();
        // Over-correction drives the raw sum negative.
        limiter.record_actual_cost(0, 500).await.unwrap();

        let stats = limiter.usage_stats().await.unwrap();
        assert_eq!(stats.ceilings[0].current, 0);
    }

    #[tokio::test]
    async fn reset_clears_all_windows() {
        let limiter = limiter(rpm(1));
        assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
        assert!(!limiter.check_and_increment(0).await.unwrap().is_admitted());

        limiter.reset().await.unwrap();
        assert!(limiter.check_and_increment(0).await.unwrap().is_admitted());
    }
}
