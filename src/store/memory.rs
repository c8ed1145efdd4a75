//! In-process counter store
//!
//! Backs the limiter for single-process deployments and tests. One mutex
//! covers the whole purge/check/append sequence, which gives the per-key
//! atomicity the admission check requires within one process. Time comes from
//! `tokio::time::Instant` so paused-clock tests behave deterministically.

use super::{Admission, CounterStore, Probe, WindowCheck};
use crate::error::GateResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    cost: i64,
}

/// In-memory sliding-window ledger
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, Vec<Entry>>>,
}

impl MemoryCounterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_and_append(&self, checks: &[WindowCheck]) -> GateResult<Admission> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        // Evaluate every window before touching any of them, so a rejection
        // leaves no trace in windows that had room.
        for check in checks {
            let entries = windows.entry(check.key.clone()).or_default();
            entries.retain(|e| now.duration_since(e.at) < check.period);

            let (current, over) = match check.probe {
                Probe::Count => {
                    let count = entries.len() as u64;
                    (count, count >= check.limit)
                }
                Probe::Cost(cost) => {
                    let sum: i64 = entries.iter().map(|e| e.cost).sum();
                    let projected = sum.saturating_add(cost as i64);
                    (projected.max(0) as u64, projected > check.limit as i64)
                }
            };

            if over {
                let retry_after = entries
                    .first()
                    .map(|e| check.period.saturating_sub(now.duration_since(e.at)))
                    .unwrap_or_default();
                return Ok(Admission::Rejected {
                    kind: check.kind,
                    current,
                    limit: check.limit,
                    retry_after,
                });
            }
        }

        for check in checks {
            let cost = match check.probe {
                Probe::Count => 0,
                Probe::Cost(cost) => cost as i64,
            };
            windows
                .entry(check.key.clone())
                .or_default()
                .push(Entry { at: now, cost });
        }

        Ok(Admission::Admitted)
    }

    async fn append(&self, key: &str, cost: i64, period: Duration) -> GateResult<()> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|e| now.duration_since(e.at) < period);
        entries.push(Entry { at: now, cost });
        Ok(())
    }

    async fn entry_count(&self, key: &str, period: Duration) -> GateResult<u64> {
        let now = Instant::now();
        let windows = self.windows.lock().await;
        Ok(windows
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| now.duration_since(e.at) < period)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn cost_sum(&self, key: &str, period: Duration) -> GateResult<i64> {
        let now = Instant::now();
        let windows = self.windows.lock().await;
        Ok(windows
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| now.duration_since(e.at) < period)
                    .map(|e| e.cost)
                    .sum()
            })
            .unwrap_or(0))
    }

    async fn clear(&self, keys: &[String]) -> GateResult<()> {
        let mut windows = self.windows.lock().await;
        for key in keys {
            windows.remove(key);
        }
        Ok(())
    }
}
