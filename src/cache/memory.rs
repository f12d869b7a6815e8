//! In-process KV store.
//!
//! Backs tests and single-node deployments. Scripts registered through
//! [`KvStore::script_load`] are executed natively with the same semantics as
//! their Lua sources, dispatched by source identity.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, GatewayResult};

use super::KvStore;
use super::scripts;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|t| t > Instant::now())
    }
}

/// Dashmap-backed [`KvStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    hashes: DashMap<String, HashMap<String, String>>,
    /// Millisecond-timestamp members of sliding windows.
    windows: DashMap<String, Vec<i64>>,
    scripts: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all registered scripts; simulates a store restart in tests.
    pub fn flush_scripts(&self) {
        self.scripts.clear();
    }

    fn get_live(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(e) if e.live() => return Some(e.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn run_script(
        &self,
        source: &str,
        keys: &[String],
        args: &[String],
    ) -> GatewayResult<Vec<i64>> {
        let arg = |i: usize| -> GatewayResult<i64> {
            args.get(i)
                .and_then(|a| a.parse::<f64>().ok())
                .map(|v| v as i64)
                .ok_or_else(|| GatewayError::Kv(format!("script argument {i} missing or invalid")))
        };
        let key = |i: usize| -> GatewayResult<&String> {
            keys.get(i)
                .ok_or_else(|| GatewayError::Kv(format!("script key {i} missing")))
        };

        if source == scripts::SLIDING_WINDOW {
            let (limit, window_s, now) = (arg(0)?, arg(1)?, arg(2)?);
            let window_ms = window_s * 1000;
            let mut window = self.windows.entry(key(0)?.clone()).or_default();
            window.retain(|&ts| ts > now - window_ms);
            let count = window.len() as i64;
            if count < limit {
                window.push(now);
                return Ok(vec![1, limit - count - 1, 0]);
            }
            let retry = window
                .first()
                .map(|&oldest| ((oldest + window_ms - now) as f64 / 1000.0).ceil() as i64)
                .unwrap_or(1)
                .max(1);
            return Ok(vec![0, 0, retry]);
        }

        if source == scripts::TOKEN_BUCKET {
            let capacity = args[0].parse::<f64>().unwrap_or(0.0);
            let refill = args[1].parse::<f64>().unwrap_or(0.0);
            let requested = args[2].parse::<f64>().unwrap_or(0.0);
            let now = arg(3)?;
            let mut hash = self.hashes.entry(key(0)?.clone()).or_default();
            let mut tokens = hash
                .get("tokens")
                .and_then(|t| t.parse::<f64>().ok())
                .unwrap_or(capacity);
            let ts = hash
                .get("ts")
                .and_then(|t| t.parse::<i64>().ok())
                .unwrap_or(now);
            let elapsed = (now - ts) as f64 / 1000.0;
            if elapsed > 0.0 {
                tokens = (tokens + elapsed * refill).min(capacity);
            }
            let (allowed, retry) = if tokens >= requested {
                tokens -= requested;
                (1, 0)
            } else if refill > 0.0 {
                (0, (((requested - tokens) / refill).ceil() as i64).max(1))
            } else {
                (0, 1)
            };
            hash.insert("tokens".into(), tokens.to_string());
            hash.insert("ts".into(), now.to_string());
            return Ok(vec![allowed, tokens.floor() as i64, retry]);
        }

        if source == scripts::QUOTA_CHECK {
            let amount = arg(0)?;
            let k = key(0)?;
            let Some(raw) = self.get_live(k) else {
                return Ok(vec![-1, 0]);
            };
            let remaining = raw.parse::<i64>().unwrap_or(0);
            if remaining >= amount {
                let left = remaining - amount;
                self.entries.insert(
                    k.clone(),
                    Entry { value: left.to_string(), expires_at: None },
                );
                return Ok(vec![1, left]);
            }
            return Ok(vec![0, remaining]);
        }

        if source == scripts::QUOTA_REFUND {
            let amount = arg(0)?;
            let ttl = arg(1)?;
            let counter_key = key(0)?.clone();
            let marker_key = key(1)?.clone();
            let marker_live = self
                .entries
                .get(&marker_key)
                .map(|e| e.live())
                .unwrap_or(false);
            if marker_live {
                let current = self
                    .get_live(&counter_key)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                return Ok(vec![0, current]);
            }
            self.entries.insert(
                marker_key,
                Entry {
                    value: "1".into(),
                    expires_at: Some(Instant::now() + Duration::from_secs(ttl.max(1) as u64)),
                },
            );
            let current = self
                .get_live(&counter_key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let left = current + amount;
            self.entries.insert(
                counter_key,
                Entry { value: left.to_string(), expires_at: None },
            );
            return Ok(vec![1, left]);
        }

        if source == scripts::TURN_RESERVE {
            let n = arg(0)?;
            let floor = arg(1)?;
            let mut hash = self.hashes.entry(key(0)?.clone()).or_default();
            let last = hash
                .get("last_turn")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
                .max(floor);
            hash.insert("last_turn".into(), (last + n).to_string());
            return Ok(vec![last + 1, last + n]);
        }

        Err(GatewayError::Kv("unknown script source".into()))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        Ok(self.get_live(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<bool> {
        let mut written = false;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                written = true;
                Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                }
            });
        if !written && !entry.live() {
            *entry = Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            };
            written = true;
        }
        Ok(written)
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        let removed = self.entries.remove(key).is_some()
            | self.hashes.remove(key).is_some()
            | self.windows.remove(key).is_some();
        Ok(removed)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> GatewayResult<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".into(),
            expires_at: None,
        });
        if !entry.live() {
            entry.value = "0".into();
            entry.expires_at = None;
        }
        let next = entry.value.parse::<i64>().unwrap_or(0) + delta;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn hget(&self, key: &str, field: &str) -> GatewayResult<Option<String>> {
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> GatewayResult<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> GatewayResult<HashMap<String, String>> {
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<bool> {
        if let Some(mut e) = self.entries.get_mut(key) {
            e.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        // Hash and window expiry is lazy; report presence only.
        Ok(self.hashes.contains_key(key) || self.windows.contains_key(key))
    }

    async fn script_load(&self, source: &str) -> GatewayResult<String> {
        let sha = hex::encode(Sha256::digest(source.as_bytes()));
        self.scripts.insert(sha.clone(), source.to_string());
        Ok(sha)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> GatewayResult<Vec<i64>> {
        let source = self
            .scripts
            .get(sha)
            .map(|s| s.clone())
            .ok_or_else(|| GatewayError::Kv("NOSCRIPT no matching script".into()))?;
        self.run_script(&source, keys, args)
    }
}
