//! Redis-backed counter store
//!
//! Rate windows live in sorted sets keyed `rate_limit:{identifier}:{kind}`
//! with the entry timestamp as score and a `"{ts}:{uuid}:{cost}"` member.
//! The combined purge/check/append step runs as one Lua script, so processes
//! sharing the same Redis never jointly over-admit a window.

use super::{Admission, CounterStore, Probe, WindowCheck};
use crate::error::{GateError, GateResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lua admission script: checks every window first, then appends to all of
/// them, or returns the breached window's index and retry hint without
/// writing anything.
///
/// Returns `{1}` on admit, `{0, window_index, current, retry_after_ms}` on
/// reject. Cost members carry their cost as the last `:`-separated field.
const ADMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local n = #KEYS
for i = 1, n do
    local base = 1 + (i - 1) * 5
    local period = tonumber(ARGV[base + 1])
    local limit = tonumber(ARGV[base + 2])
    local mode = tonumber(ARGV[base + 3])
    local cost = tonumber(ARGV[base + 4])
    redis.call('ZREMRANGEBYSCORE', KEYS[i], 0, now - period)
    local current = 0
    local over = false
    if mode == 0 then
        current = redis.call('ZCARD', KEYS[i])
        over = current >= limit
    else
        local members = redis.call('ZRANGE', KEYS[i], 0, -1)
        local sum = 0
        for _, m in ipairs(members) do
            local c = string.match(m, ':(%-?%d+)$')
            if c then sum = sum + tonumber(c) end
        end
        current = sum + cost
        over = current > limit
    end
    if over then
        local retry = 0
        local oldest = redis.call('ZRANGE', KEYS[i], 0, 0, 'WITHSCORES')
        if oldest[2] then
            retry = (tonumber(oldest[2]) + period) - now
            if retry < 0 then retry = 0 end
        end
        if current < 0 then current = 0 end
        return {0, i, current, math.floor(retry * 1000)}
    end
end
for i = 1, n do
    local base = 1 + (i - 1) * 5
    local period = tonumber(ARGV[base + 1])
    redis.call('ZADD', KEYS[i], now, ARGV[base + 5])
    redis.call('EXPIRE', KEYS[i], period)
end
return {1}
"#;

/// Counter store shared across processes through Redis
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    admit: Script,
}

impl RedisCounterStore {
    /// Connect to the given Redis URL
    pub async fn connect(url: &str) -> GateResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn))
    }

    /// Build a store over an existing connection manager
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            admit: Script::new(ADMIT_SCRIPT),
        }
    }

    fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn member(now: f64, cost: i64) -> String {
        format!("{now}:{}:{cost}", Uuid::new_v4())
    }

    /// Parse the trailing `:cost` field of a sorted-set member
    fn member_cost(member: &str) -> Option<i64> {
        member.rsplit(':').next()?.parse().ok()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_append(&self, checks: &[WindowCheck]) -> GateResult<Admission> {
        if checks.is_empty() {
            return Ok(Admission::Admitted);
        }

        let now = Self::now_secs();
        let mut invocation = self.admit.prepare_invoke();
        invocation.arg(now);
        for check in checks {
            invocation.key(&check.key);
            let (mode, cost) = match check.probe {
                Probe::Count => (0u8, 0i64),
                Probe::Cost(cost) => (1u8, cost as i64),
            };
            invocation
                .arg(check.period.as_secs())
                .arg(check.limit)
                .arg(mode)
                .arg(cost)
                .arg(Self::member(now, cost));
        }

        let mut conn = self.conn.clone();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;

        match reply.first().copied() {
            Some(1) => Ok(Admission::Admitted),
            Some(0) if reply.len() >= 4 => {
                let index = (reply[1] as usize).saturating_sub(1);
                let check = checks.get(index).ok_or_else(|| {
                    GateError::store("admission script returned an unknown window index")
                })?;
                Ok(Admission::Rejected {
                    kind: check.kind,
                    current: reply[2].max(0) as u64,
                    limit: check.limit,
                    retry_after: Duration::from_millis(reply[3].max(0) as u64),
                })
            }
            _ => Err(GateError::store("malformed admission script reply")),
        }
    }

    async fn append(&self, key: &str, cost: i64, period: Duration) -> GateResult<()> {
        let now = Self::now_secs();
        let mut conn = self.conn.clone();
        let () = conn.zadd(key, Self::member(now, cost), now).await?;
        let () = conn.expire(key, period.as_secs() as i64).await?;
        Ok(())
    }

    async fn entry_count(&self, key: &str, period: Duration) -> GateResult<u64> {
        let window_start = Self::now_secs() - period.as_secs_f64();
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcount(key, window_start, f64::INFINITY).await?;
        Ok(count)
    }

    async fn cost_sum(&self, key: &str, period: Duration) -> GateResult<i64> {
        let window_start = Self::now_secs() - period.as_secs_f64();
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(key, window_start, f64::INFINITY)
            .await?;
        Ok(members.iter().filter_map(|m| Self::member_cost(m)).sum())
    }

    async fn clear(&self, keys: &[String]) -> GateResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let () = conn.del(keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CeilingKind;

    #[test]
    fn member_cost_parses_trailing_field() {
        assert_eq!(RedisCounterStore::member_cost("1700000000.5:abc:120"), Some(120));
        assert_eq!(RedisCounterStore::member_cost("1700000000.5:abc:-80"), Some(-80));
        assert_eq!(RedisCounterStore::member_cost("not-a-member"), None);
    }

    #[test]
    fn member_encodes_cost_last() {
        let member = RedisCounterStore::member(1_700_000_000.25, -42);
        assert_eq!(RedisCounterStore::member_cost(&member), Some(-42));
    }

    #[test]
    fn kind_periods_match_keys() {
        assert_eq!(CeilingKind::Rpm.period().as_secs(), 60);
        assert_eq!(CeilingKind::Rpd.period().as_secs(), 86_400);
    }
}
