//! Cache/KV Abstraction
//!
//! A typed wrapper over a key-value store with atomic script execution,
//! TTLs, and namespaced keys. Two backends: [`MemoryStore`] (always
//! available, used by tests and embedded deployments) and [`RedisStore`]
//! behind the `redis-store` feature.

mod keys;
mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;
pub mod scripts;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::GatewayResult;

pub use keys::CacheKeys;
pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use scripts::ScriptSet;

/// Key-value store contract used by every stateful component.
///
/// Writes without a TTL are best-effort fire-and-forget; callers that need
/// durability pass a TTL and check the result.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()>;

    /// Set only when absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<bool>;

    async fn delete(&self, key: &str) -> GatewayResult<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> GatewayResult<i64>;

    async fn hget(&self, key: &str, field: &str) -> GatewayResult<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> GatewayResult<()>;

    async fn hgetall(&self, key: &str) -> GatewayResult<HashMap<String, String>>;

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<bool>;

    /// Register a script and return its handle (sha for Redis).
    async fn script_load(&self, source: &str) -> GatewayResult<String>;

    /// Evaluate a previously loaded script. Implementations surface a
    /// `NOSCRIPT`-style error when the handle is unknown so [`ScriptSet`]
    /// can reload and retry.
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String])
    -> GatewayResult<Vec<i64>>;
}

/// Apply ±`ratio` jitter to a TTL so a burst of same-lifetime keys does not
/// expire in one stampede.
pub fn jittered_ttl(ttl: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return ttl;
    }
    let base = ttl.as_millis() as f64;
    let spread = base * ratio;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base + offset).max(1.0) as u64)
}
