//! Per-host circuit breaker over the KV store.
//!
//! Three states in a KV hash so every gateway process sees the same view:
//! closed → open at the failure threshold, open → half-open after the reset
//! window, half-open → closed after enough probe successes, half-open →
//! open on any probe failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::cache::{CacheKeys, KvStore};
use crate::config::GatewayConfig;
use crate::error::GatewayResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Normal traffic.
    Closed,
    /// One probe is allowed through.
    HalfOpenProbe,
    /// Fail fast without calling the host.
    Open,
}

pub struct CircuitBreaker {
    kv: Arc<dyn KvStore>,
    failure_threshold: u32,
    reset_seconds: u64,
    close_successes: u32,
}

impl CircuitBreaker {
    pub fn new(kv: Arc<dyn KvStore>, config: &GatewayConfig) -> Self {
        Self {
            kv,
            failure_threshold: config.circuit_failure_threshold,
            reset_seconds: config.circuit_reset_seconds,
            close_successes: config.circuit_close_successes,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.reset_seconds * 2)
    }

    /// Decide whether `host` may be called right now.
    pub async fn check(&self, host: &str) -> GatewayResult<CircuitDecision> {
        let key = CacheKeys::circuit_breaker(host);
        let state = self.kv.hgetall(&key).await?;
        match state.get("state").map(String::as_str) {
            Some("open") => {
                let opened_at = state
                    .get("opened_at")
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let now = Utc::now().timestamp() as f64;
                if now - opened_at >= self.reset_seconds as f64 {
                    self.kv.hset(&key, "state", "half_open").await?;
                    self.kv.hset(&key, "success_count", "0").await?;
                    self.kv.expire(&key, self.ttl()).await?;
                    info!(host, "circuit half-open, probing");
                    Ok(CircuitDecision::HalfOpenProbe)
                } else {
                    Ok(CircuitDecision::Open)
                }
            }
            Some("half_open") => Ok(CircuitDecision::HalfOpenProbe),
            _ => Ok(CircuitDecision::Closed),
        }
    }

    pub async fn record_success(&self, host: &str) -> GatewayResult<()> {
        let key = CacheKeys::circuit_breaker(host);
        let state = self.kv.hgetall(&key).await?;
        match state.get("state").map(String::as_str) {
            Some("half_open") => {
                let successes = state
                    .get("success_count")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(0)
                    + 1;
                if successes >= self.close_successes {
                    self.kv.delete(&key).await?;
                    info!(host, "circuit closed");
                } else {
                    self.kv
                        .hset(&key, "success_count", &successes.to_string())
                        .await?;
                    self.kv.expire(&key, self.ttl()).await?;
                }
            }
            Some(_) | None => {
                // A success in closed state clears any failure streak.
                if state.contains_key("failures") {
                    self.kv.delete(&key).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn record_failure(&self, host: &str) -> GatewayResult<()> {
        let key = CacheKeys::circuit_breaker(host);
        let state = self.kv.hgetall(&key).await?;
        let now = Utc::now().timestamp().to_string();
        match state.get("state").map(String::as_str) {
            Some("half_open") => {
                // Any probe failure reopens immediately.
                self.kv.hset(&key, "state", "open").await?;
                self.kv.hset(&key, "opened_at", &now).await?;
                self.kv.hset(&key, "success_count", "0").await?;
                self.kv.expire(&key, self.ttl()).await?;
                warn!(host, "circuit reopened from half-open");
            }
            Some("open") => {}
            _ => {
                let failures = state
                    .get("failures")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(0)
                    + 1;
                self.kv
                    .hset(&key, "failures", &failures.to_string())
                    .await?;
                if failures >= self.failure_threshold {
                    self.kv.hset(&key, "state", "open").await?;
                    self.kv.hset(&key, "opened_at", &now).await?;
                    warn!(host, failures, "circuit opened");
                }
                self.kv.expire(&key, self.ttl()).await?;
            }
        }
        Ok(())
    }
}
