//! Atomic KV scripts.
//!
//! Lua sources evaluated server-side on Redis; the in-memory store executes
//! the same semantics natively, keyed by source identity. All scripts take
//! `now` as an argument so tests stay deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{GatewayError, GatewayResult};

use super::KvStore;

/// Sliding-window rate limit.
///
/// KEYS: window zset. ARGV: limit, window_seconds, now_ms.
/// Returns `{allowed, remaining, retry_after_seconds}`.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2]) * 1000
local now = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, 0, now - window_ms)
local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, tostring(now) .. '-' .. tostring(count))
    redis.call('PEXPIRE', key, window_ms)
    return {1, limit - count - 1, 0}
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry = 1
if oldest[2] then
    retry = math.ceil((tonumber(oldest[2]) + window_ms - now) / 1000)
    if retry < 1 then retry = 1 end
end
return {0, 0, retry}
"#;

/// Token-bucket rate limit.
///
/// KEYS: bucket hash. ARGV: capacity, refill_per_second, requested, now_ms.
/// Returns `{allowed, tokens_left, retry_after_seconds}`.
pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local data = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(data[1])
local ts = tonumber(data[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end
local elapsed = (now - ts) / 1000
if elapsed > 0 then
    tokens = math.min(capacity, tokens + elapsed * refill)
end
local allowed = 0
local retry = 0
if tokens >= requested then
    allowed = 1
    tokens = tokens - requested
elseif refill > 0 then
    retry = math.ceil((requested - tokens) / refill)
    if retry < 1 then retry = 1 end
else
    retry = 1
end
redis.call('HSET', key, 'tokens', tokens, 'ts', now)
redis.call('PEXPIRE', key, 3600000)
return {allowed, math.floor(tokens), retry}
"#;

/// Quota check-and-decrement.
///
/// KEYS: quota counter. ARGV: amount.
/// Returns `{-1, 0}` on cold counter (caller warms from the repository),
/// `{1, remaining}` when granted, `{0, remaining}` when denied.
pub const QUOTA_CHECK: &str = r#"
local key = KEYS[1]
local amount = tonumber(ARGV[1])
local raw = redis.call('GET', key)
if not raw then
    return {-1, 0}
end
local remaining = tonumber(raw)
if remaining >= amount then
    local left = redis.call('DECRBY', key, amount)
    return {1, left}
end
return {0, remaining}
"#;

/// Idempotent quota refund.
///
/// KEYS: quota counter, refund marker. ARGV: amount, marker_ttl_seconds.
/// Returns `{1, remaining}` when refunded, `{0, remaining}` when the marker
/// already existed.
pub const QUOTA_REFUND: &str = r#"
local key = KEYS[1]
local marker = KEYS[2]
local amount = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
if redis.call('SET', marker, '1', 'NX', 'EX', ttl) then
    local left = redis.call('INCRBY', key, amount)
    return {1, left}
end
return {0, tonumber(redis.call('GET', key) or '0')}
"#;

/// Turn-index reservation.
///
/// KEYS: conversation meta hash. ARGV: n, db_floor, ttl_seconds.
/// Advances `last_turn` by `n`, never below `db_floor`, and returns
/// `{first_reserved, new_last_turn}`.
pub const TURN_RESERVE: &str = r#"
local key = KEYS[1]
local n = tonumber(ARGV[1])
local floor = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local last = tonumber(redis.call('HGET', key, 'last_turn') or '0')
if floor > last then
    last = floor
end
redis.call('HSET', key, 'last_turn', last + n)
redis.call('EXPIRE', key, ttl)
return {last + 1, last + n}
"#;

/// Script names used by [`ScriptSet`].
pub mod names {
    pub const SLIDING_WINDOW: &str = "sliding_window_rate_limit";
    pub const TOKEN_BUCKET: &str = "token_bucket_rate_limit";
    pub const QUOTA_CHECK: &str = "quota_check_decrement";
    pub const QUOTA_REFUND: &str = "quota_refund";
    pub const TURN_RESERVE: &str = "turn_index_reserve";
}

fn builtin_sources() -> Vec<(&'static str, &'static str)> {
    vec![
        (names::SLIDING_WINDOW, SLIDING_WINDOW),
        (names::TOKEN_BUCKET, TOKEN_BUCKET),
        (names::QUOTA_CHECK, QUOTA_CHECK),
        (names::QUOTA_REFUND, QUOTA_REFUND),
        (names::TURN_RESERVE, TURN_RESERVE),
    ]
}

/// Registered scripts with their store handles.
///
/// `eval` transparently reloads on a `NOSCRIPT` reply and retries once,
/// covering store restarts that drop the script cache.
pub struct ScriptSet {
    store: Arc<dyn KvStore>,
    shas: RwLock<HashMap<&'static str, String>>,
    sources: HashMap<&'static str, &'static str>,
}

impl ScriptSet {
    /// Load every builtin script into the store.
    pub async fn register(store: Arc<dyn KvStore>) -> GatewayResult<Self> {
        let sources: HashMap<_, _> = builtin_sources().into_iter().collect();
        let mut shas = HashMap::new();
        for (name, source) in &sources {
            let sha = store.script_load(source).await?;
            shas.insert(*name, sha);
        }
        Ok(Self { store, shas: RwLock::new(shas), sources })
    }

    pub async fn eval(
        &self,
        name: &'static str,
        keys: &[String],
        args: &[String],
    ) -> GatewayResult<Vec<i64>> {
        let sha = self
            .shas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::Kv(format!("script {name} not registered")))?;

        match self.store.eval_sha(&sha, keys, args).await {
            Err(GatewayError::Kv(msg)) if msg.contains("NOSCRIPT") => {
                let source = self
                    .sources
                    .get(name)
                    .ok_or_else(|| GatewayError::Kv(format!("no source for script {name}")))?;
                let sha = self.store.script_load(source).await?;
                self.shas.write().insert(name, sha.clone());
                self.store.eval_sha(&sha, keys, args).await
            }
            other => other,
        }
    }
}
