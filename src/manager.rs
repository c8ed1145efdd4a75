//! Per-role provider selection, health tracking, and statistics
//!
//! One manager owns the providers backing one logical role. Selection walks
//! the healthy candidates in strategy order and admits the first one whose
//! rate limiter has room. Health fields live here exclusively; callers only
//! ever see immutable snapshots.

use crate::error::{GateError, GateResult};
use crate::limiter::{RateLimiter, UsageStats};
use crate::provider::{
    HealthPolicy, HealthState, ProviderConfig, ProviderSnapshot, RotationStrategy,
};
use crate::store::{Admission, CounterStore};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct ProviderState {
    config: ProviderConfig,
    identifier: String,
    limiter: RateLimiter,
    health: Mutex<HealthState>,
}

/// Structured snapshot of one provider for external exposure
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    /// Provider name
    pub name: String,
    /// Model identifier
    pub model: String,
    /// Configured priority
    pub priority: u32,
    /// Enabled flag from configuration
    pub enabled: bool,
    /// Current health verdict
    pub healthy: bool,
    /// Requests recorded so far
    pub total_requests: u64,
    /// Current consecutive-failure count
    pub failure_count: u32,
    /// Nested rate-limiter usage
    pub rate_limits: UsageStats,
}

/// Selects an admissible provider for one role and tracks outcomes
pub struct ProviderManager {
    role: String,
    providers: Vec<ProviderState>,
    strategy: RotationStrategy,
    policy: HealthPolicy,
    cursor: AtomicUsize,
}

impl ProviderManager {
    /// Build a manager with the default health policy
    ///
    /// An empty provider list is a fatal configuration error.
    pub fn new(
        role: impl Into<String>,
        providers: Vec<ProviderConfig>,
        strategy: RotationStrategy,
        store: Arc<dyn CounterStore>,
    ) -> GateResult<Self> {
        Self::with_policy(role, providers, strategy, store, HealthPolicy::default())
    }

    /// Build a manager with an explicit health policy
    pub fn with_policy(
        role: impl Into<String>,
        mut providers: Vec<ProviderConfig>,
        strategy: RotationStrategy,
        store: Arc<dyn CounterStore>,
        policy: HealthPolicy,
    ) -> GateResult<Self> {
        let role = role.into();
        if providers.is_empty() {
            return Err(GateError::config(format!(
                "no providers configured for role '{role}'"
            )));
        }

        // Sorted once at construction, never reordered afterwards.
        providers.sort_by_key(|p| p.priority);

        let providers = providers
            .into_iter()
            .map(|config| {
                let identifier = config.identifier();
                let limiter = RateLimiter::new(identifier.clone(), config.limits(), store.clone());
                ProviderState {
                    config,
                    identifier,
                    limiter,
                    health: Mutex::new(HealthState::default()),
                }
            })
            .collect();

        Ok(Self {
            role,
            providers,
            strategy,
            policy,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The role this manager serves
    pub fn role(&self) -> &str {
        &self.role
    }

    /// The configured rotation strategy
    pub fn strategy(&self) -> RotationStrategy {
        self.strategy
    }

    /// Number of configured providers
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Select the first admissible provider outside `exclude`
    ///
    /// Returns `Ok(None)` when no enabled, healthy, non-excluded provider
    /// exists or when every candidate is rate limited.
    pub async fn get_next_provider(
        &self,
        estimated_cost: u64,
        exclude: &[String],
    ) -> GateResult<Option<ProviderSnapshot>> {
        let candidates: Vec<usize> = self
            .providers
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.config.enabled
                    && !exclude.contains(&p.identifier)
                    && p.health.lock().check(&self.policy)
            })
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            warn!(role = %self.role, "no healthy provider available");
            return Ok(None);
        }

        // The cursor advances exactly once per invocation, admitted or not,
        // so rejections do not starve later providers of their turn.
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        let ordered = self.order_candidates(&candidates, cursor);

        for index in ordered {
            let state = &self.providers[index];
            match state.limiter.check_and_increment(estimated_cost).await? {
                Admission::Admitted => {
                    debug!(
                        role = %self.role,
                        provider = %state.config.name,
                        strategy = %self.strategy,
                        "provider selected"
                    );
                    return Ok(Some(snapshot(state)));
                }
                Admission::Rejected { kind, .. } => {
                    debug!(
                        role = %self.role,
                        provider = %state.config.name,
                        kind = %kind,
                        "provider rate limited, trying next"
                    );
                }
            }
        }

        warn!(role = %self.role, "all candidate providers rate limited");
        Ok(None)
    }

    fn order_candidates(&self, candidates: &[usize], cursor: usize) -> Vec<usize> {
        match self.strategy {
            RotationStrategy::RoundRobin => {
                let start = cursor % candidates.len();
                candidates[start..]
                    .iter()
                    .chain(candidates[..start].iter())
                    .copied()
                    .collect()
            }
            RotationStrategy::LeastUsed => {
                // Candidates arrive in priority order; a stable sort keeps
                // priority as the tie-breaker.
                let mut ordered = candidates.to_vec();
                ordered.sort_by_key(|&i| self.providers[i].health.lock().total_requests);
                ordered
            }
            RotationStrategy::Random => {
                let mut ordered = candidates.to_vec();
                ordered.shuffle(&mut rand::thread_rng());
                ordered
            }
        }
    }

    /// Record the outcome of one call against the selected provider
    ///
    /// Success pays down the failure count; failure bumps it and stamps the
    /// failure time. A non-zero `actual_cost` is forwarded to the provider's
    /// limiter for TPM reconciliation.
    pub async fn record_request_result(
        &self,
        provider: &ProviderSnapshot,
        success: bool,
        actual_cost: u64,
        estimated_cost: u64,
    ) -> GateResult<()> {
        let Some(state) = self
            .providers
            .iter()
            .find(|p| p.identifier == provider.identifier)
        else {
            // A reload can race an in-flight call; the outcome of a retired
            // provider is not worth failing the caller over.
            warn!(
                role = %self.role,
                provider = %provider.name,
                "result reported for unknown provider, ignoring"
            );
            return Ok(());
        };

        {
            let mut health = state.health.lock();
            if success {
                health.record_success();
            } else {
                health.record_failure();
            }
        }

        if actual_cost > 0 {
            state.limiter.record_actual_cost(actual_cost, estimated_cost).await?;
        }
        Ok(())
    }

    /// Health verdict for one provider identifier
    pub fn is_healthy(&self, identifier: &str) -> bool {
        self.providers
            .iter()
            .find(|p| p.identifier == identifier)
            .map(|p| p.config.enabled && p.health.lock().check(&self.policy))
            .unwrap_or(false)
    }

    /// Structured snapshot of every provider, in priority order
    pub async fn stats(&self) -> GateResult<Vec<ProviderStats>> {
        let mut out = Vec::with_capacity(self.providers.len());
        for state in &self.providers {
            let (healthy, total_requests, failure_count) = {
                let mut health = state.health.lock();
                (
                    state.config.enabled && health.check(&self.policy),
                    health.total_requests,
                    health.failure_count,
                )
            };
            let rate_limits = state.limiter.usage_stats().await?;
            out.push(ProviderStats {
                name: state.config.name.clone(),
                model: state.config.model.clone(),
                priority: state.config.priority,
                enabled: state.config.enabled,
                healthy,
                total_requests,
                failure_count,
                rate_limits,
            });
        }
        Ok(out)
    }

    /// Clear every provider's rate windows
    pub async fn reset_limits(&self) -> GateResult<()> {
        for state in &self.providers {
            state.limiter.reset().await?;
        }
        Ok(())
    }
}

fn snapshot(state: &ProviderState) -> ProviderSnapshot {
    ProviderSnapshot {
        name: state.config.name.clone(),
        identifier: state.identifier.clone(),
        credential: state.config.credential.clone(),
        model: state.config.model.clone(),
        endpoint: state.config.endpoint.clone(),
        priority: state.config.priority,
    }
}
