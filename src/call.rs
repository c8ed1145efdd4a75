//! Managed retry/failover loop around one logical model call
//!
//! Turns "pick a provider, call it, report the outcome" into a bounded,
//! observable operation: each failed attempt excludes its provider, backs off
//! linearly on the attempt number, and emits a failover notice before the
//! next provider is tried.

use crate::config::RoleConfig;
use crate::error::{GateError, GateResult};
use crate::manager::ProviderManager;
use crate::provider::ProviderSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Token accounting reported by the transport
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u64,
    /// Tokens generated
    pub completion_tokens: u64,
    /// Total tokens billed
    pub total_tokens: u64,
}

/// Result of one underlying provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    /// Opaque response body
    pub body: Value,
    /// Usage for rate reconciliation
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Outbound transport to a model endpoint; wire format is opaque to the core
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one call against the given provider's credential/model/endpoint
    async fn send(&self, provider: &ProviderSnapshot, payload: &Value)
        -> GateResult<CallResponse>;
}

/// Receives a human-observable notice before each non-primary attempt
#[async_trait]
pub trait FailoverNotifier: Send + Sync {
    /// Called with the newly selected provider before the retried call runs
    async fn on_failover(&self, provider: &str, attempt: u32);
}

/// Default notifier that logs failovers through `tracing`
pub struct LogNotifier;

#[async_trait]
impl FailoverNotifier for LogNotifier {
    async fn on_failover(&self, provider: &str, attempt: u32) {
        warn!(provider, attempt, "falling back to alternate provider");
    }
}

/// Bounds and pacing for one managed call
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Maximum providers tried per logical call
    pub max_attempts: u32,
    /// Attempt n waits `base_delay * n` before retrying
    pub base_delay: Duration,
    /// Overall deadline; in-flight work is abandoned when it elapses
    pub timeout: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            timeout: None,
        }
    }
}

impl CallOptions {
    /// Derive options from a role's retry configuration
    ///
    /// With `auto_retry` off the call gets exactly one attempt.
    pub fn from_role(config: &RoleConfig) -> Self {
        Self {
            max_attempts: if config.auto_retry {
                config.max_retries.max(1)
            } else {
                1
            },
            base_delay: config.base_delay(),
            timeout: None,
        }
    }

    /// Set the overall deadline
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

/// Bounded retry/failover loop consumed by agent callers
pub struct ManagedCaller {
    manager: Arc<ProviderManager>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn FailoverNotifier>,
    options: CallOptions,
}

impl ManagedCaller {
    /// Create a caller with the default log-based notifier
    pub fn new(
        manager: Arc<ProviderManager>,
        transport: Arc<dyn Transport>,
        options: CallOptions,
    ) -> Self {
        Self {
            manager,
            transport,
            notifier: Arc::new(LogNotifier),
            options,
        }
    }

    /// Replace the failover notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn FailoverNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Execute one logical call with failover across providers
    ///
    /// Admitted entries of an abandoned (timed-out) call are not rolled back;
    /// they age out of their windows, undercounting available capacity rather
    /// than overcounting it.
    pub async fn execute(&self, payload: Value, estimated_cost: u64) -> GateResult<CallResponse> {
        match self.options.timeout {
            Some(limit) => match timeout(limit, self.run(payload, estimated_cost)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(role = %self.manager.role(), "call abandoned after overall timeout");
                    Err(GateError::Timeout { elapsed: limit })
                }
            },
            None => self.run(payload, estimated_cost).await,
        }
    }

    async fn run(&self, payload: Value, estimated_cost: u64) -> GateResult<CallResponse> {
        let mut excluded: Vec<String> = Vec::new();
        let mut last_error: Option<GateError> = None;

        for attempt in 0..self.options.max_attempts {
            let Some(provider) = self
                .manager
                .get_next_provider(estimated_cost, &excluded)
                .await?
            else {
                return Err(last_error.take().unwrap_or_else(|| {
                    GateError::exhausted(format!(
                        "no provider admitted the request for role '{}'",
                        self.manager.role()
                    ))
                }));
            };

            if attempt > 0 {
                self.notifier.on_failover(&provider.name, attempt).await;
                info!(
                    role = %self.manager.role(),
                    provider = %provider.name,
                    attempt,
                    "retrying with alternate provider"
                );
            }

            match self.transport.send(&provider, &payload).await {
                Ok(response) => {
                    self.manager
                        .record_request_result(
                            &provider,
                            true,
                            response.usage.total_tokens,
                            estimated_cost,
                        )
                        .await?;
                    return Ok(response);
                }
                Err(err) => {
                    warn!(
                        role = %self.manager.role(),
                        provider = %provider.name,
                        attempt,
                        error = %err,
                        "provider call failed"
                    );
                    self.manager
                        .record_request_result(&provider, false, 0, estimated_cost)
                        .await?;
                    excluded.push(provider.identifier.clone());
                    last_error = Some(match err {
                        wrapped @ GateError::ProviderCall { .. } => wrapped,
                        other => GateError::provider_call(&provider.name, other.to_string()),
                    });
                    if attempt + 1 < self.options.max_attempts {
                        sleep(self.options.base_delay * (attempt + 1)).await;
                    }
                }
            }
        }

        error!(
            role = %self.manager.role(),
            attempts = self.options.max_attempts,
            "all failover attempts exhausted"
        );
        Err(last_error.unwrap_or_else(|| {
            GateError::exhausted(format!(
                "all {} attempts failed for role '{}'",
                self.options.max_attempts,
                self.manager.role()
            ))
        }))
    }
}

/// Rough token estimate for chat-style payloads: content characters / 4
pub fn estimate_tokens(messages: &[Value]) -> u64 {
    messages
        .iter()
        .filter_map(|message| message.get("content").and_then(Value::as_str))
        .map(|content| (content.chars().count() / 4) as u64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderConfig, RotationStrategy};
    use crate::store::MemoryCounterStore;
    use parking_lot::Mutex;
    use serde_json::json;

    fn provider(name: &str, priority: u32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            credential: format!("sk-{name}"),
            model: "test-model".to_string(),
            endpoint: "https://example.invalid/v1".to_string(),
            priority,
            rpm: None,
            tpm: None,
            rpd: None,
            enabled: true,
        }
    }

    fn manager(providers: Vec<ProviderConfig>) -> Arc<ProviderManager> {
        Arc::new(
            ProviderManager::new(
                "coder",
                providers,
                RotationStrategy::RoundRobin,
                Arc::new(MemoryCounterStore::new()),
            )
            .unwrap(),
        )
    }

    /// Transport that fails for the named providers and succeeds elsewhere
    struct FlakyTransport {
        failing: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FlakyTransport {
        fn failing(names: &[&str]) -> Self {
            Self {
                failing: names.iter().map(|n| n.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(
            &self,
            provider: &ProviderSnapshot,
            _payload: &Value,
        ) -> GateResult<CallResponse> {
            self.calls.lock().push(provider.name.clone());
            if self.failing.contains(&provider.name) {
                return Err(GateError::provider_call(&provider.name, "upstream 503"));
            }
            Ok(CallResponse {
                body: json!({"ok": true, "provider": provider.name}),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    /// Notifier that records every failover it sees
    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl FailoverNotifier for RecordingNotifier {
        async fn on_failover(&self, provider: &str, attempt: u32) {
            self.events.lock().push((provider.to_string(), attempt));
        }
    }

    fn options() -> CallOptions {
        CallOptions {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_healthy_provider() {
        let transport = Arc::new(FlakyTransport::failing(&[]));
        let caller = ManagedCaller::new(
            manager(vec![provider("p1", 1), provider("p2", 2)]),
            transport.clone(),
            options(),
        );

        let response = caller.execute(json!({"messages": []}), 0).await.unwrap();
        assert_eq!(response.body["provider"], "p1");
        assert_eq!(transport.calls.lock().as_slice(), ["p1"]);
    }

    #[tokio::test]
    async fn fails_over_and_notifies_with_new_provider() {
        let transport = Arc::new(FlakyTransport::failing(&["p1"]));
        let notifier = Arc::new(RecordingNotifier::default());
        let caller = ManagedCaller::new(
            manager(vec![provider("p1", 1), provider("p2", 2)]),
            transport.clone(),
            options(),
        )
        .with_notifier(notifier.clone());

        let response = caller.execute(json!({}), 0).await.unwrap();
        assert_eq!(response.body["provider"], "p2");
        assert_eq!(transport.calls.lock().as_slice(), ["p1", "p2"]);

        // The notice names the provider the call fell back to.
        let events = notifier.events.lock();
        assert_eq!(events.as_slice(), [("p2".to_string(), 1)]);
    }

    #[tokio::test]
    async fn surfaces_last_error_when_all_attempts_fail() {
        let transport = Arc::new(FlakyTransport::failing(&["p1", "p2"]));
        let caller = ManagedCaller::new(
            manager(vec![provider("p1", 1), provider("p2", 2)]),
            transport,
            options(),
        );

        let err = caller.execute(json!({}), 0).await.unwrap_err();
        match err {
            GateError::ProviderCall { provider, .. } => assert_eq!(provider, "p2"),
            other => panic!("expected ProviderCall, got {other}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_error_when_no_provider_admits() {
        let mut limited = provider("p1", 1);
        limited.rpm = Some(1);
        let transport = Arc::new(FlakyTransport::failing(&[]));
        let caller = ManagedCaller::new(manager(vec![limited]), transport, options());

        caller.execute(json!({}), 0).await.unwrap();
        let err = caller.execute(json!({}), 0).await.unwrap_err();
        assert!(matches!(err, GateError::Exhausted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_abandons_retries() {
        struct SlowTransport;

        #[async_trait]
        impl Transport for SlowTransport {
            async fn send(
                &self,
                _provider: &ProviderSnapshot,
                _payload: &Value,
            ) -> GateResult<CallResponse> {
                sleep(Duration::from_secs(600)).await;
                Ok(CallResponse {
                    body: Value::Null,
                    usage: TokenUsage::default(),
                })
            }
        }

        let caller = ManagedCaller::new(
            manager(vec![provider("p1", 1)]),
            Arc::new(SlowTransport),
            options().with_timeout(Duration::from_secs(5)),
        );

        let err = caller.execute(json!({}), 0).await.unwrap_err();
        assert!(matches!(err, GateError::Timeout { .. }));
    }

    #[tokio::test]
    async fn success_records_usage_against_the_provider() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut metered = provider("p1", 1);
        metered.tpm = Some(1000);
        let manager = Arc::new(
            ProviderManager::new("coder", vec![metered], RotationStrategy::RoundRobin, store)
                .unwrap(),
        );
        let caller = ManagedCaller::new(
            manager.clone(),
            Arc::new(FlakyTransport::failing(&[])),
            options(),
        );

        // Estimated 100 tokens, actual 15: the correction lands in the window.
        caller.execute(json!({}), 100).await.unwrap();

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats[0].total_requests, 1);
        assert_eq!(stats[0].rate_limits.ceilings[0].current, 15);
    }

    #[test]
    fn disabling_auto_retry_caps_attempts_at_one() {
        let role = RoleConfig {
            auto_retry: false,
            max_retries: 5,
            ..Default::default()
        };
        assert_eq!(CallOptions::from_role(&role).max_attempts, 1);

        let role = RoleConfig {
            max_retries: 5,
            ..Default::default()
        };
        assert_eq!(CallOptions::from_role(&role).max_attempts, 5);
    }

    #[test]
    fn estimate_tokens_counts_content_chars() {
        let messages = vec![
            json!({"role": "user", "content": "abcdefgh"}),
            json!({"role": "assistant", "content": "ijkl"}),
            json!({"role": "tool"}),
        ];
        assert_eq!(estimate_tokens(&messages), 3);
    }
}
