//! Rate-Limit / Quota Enforcement
//!
//! Both limiters run as atomic scripts in the KV store so decisions stay
//! linearisable per key: sliding-window RPM, token-bucket TPM, and per-key
//! quota check-and-decrement with idempotent refunds.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::cache::scripts::names;
use crate::cache::{CacheKeys, KvStore, ScriptSet};
use crate::error::{GatewayError, GatewayResult, QuotaKind};
use crate::repo::QuotaRepository;

/// One limiter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after: u64,
}

pub struct RateLimiter {
    scripts: Arc<ScriptSet>,
}

impl RateLimiter {
    pub fn new(scripts: Arc<ScriptSet>) -> Self {
        Self { scripts }
    }

    /// Sliding-window requests-per-minute check for `subject`.
    pub async fn check_rpm(
        &self,
        subject: &str,
        limit: u64,
        window_seconds: u64,
    ) -> GatewayResult<RateDecision> {
        let reply = self
            .scripts
            .eval(
                names::SLIDING_WINDOW,
                &[CacheKeys::rate_limit_rpm(subject)],
                &[
                    limit.to_string(),
                    window_seconds.to_string(),
                    Utc::now().timestamp_millis().to_string(),
                ],
            )
            .await?;
        Ok(decision_from_reply(&reply))
    }

    /// Token-bucket tokens-per-minute check; `requested` is the estimated
    /// token cost of this request.
    pub async fn check_tpm(
        &self,
        subject: &str,
        tpm_limit: u64,
        requested: u64,
    ) -> GatewayResult<RateDecision> {
        let refill_per_second = (tpm_limit as f64 / 60.0).max(f64::MIN_POSITIVE);
        let reply = self
            .scripts
            .eval(
                names::TOKEN_BUCKET,
                &[CacheKeys::rate_limit_tpm(subject)],
                &[
                    tpm_limit.to_string(),
                    refill_per_second.to_string(),
                    requested.to_string(),
                    Utc::now().timestamp_millis().to_string(),
                ],
            )
            .await?;
        Ok(decision_from_reply(&reply))
    }
}

fn decision_from_reply(reply: &[i64]) -> RateDecision {
    RateDecision {
        allowed: reply.first().copied().unwrap_or(0) == 1,
        remaining: reply.get(1).copied().unwrap_or(0).max(0) as u64,
        retry_after: reply.get(2).copied().unwrap_or(0).max(0) as u64,
    }
}

/// Quota decision including the kind that denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u64,
}

pub struct QuotaEnforcer {
    kv: Arc<dyn KvStore>,
    scripts: Arc<ScriptSet>,
    repo: Arc<dyn QuotaRepository>,
}

impl QuotaEnforcer {
    pub fn new(
        kv: Arc<dyn KvStore>,
        scripts: Arc<ScriptSet>,
        repo: Arc<dyn QuotaRepository>,
    ) -> Self {
        Self { kv, scripts, repo }
    }

    /// Atomically check and decrement one quota kind. A cold counter warms
    /// from the repository first, then the script runs again.
    pub async fn check_and_decrement(
        &self,
        api_key_id: &str,
        kind: QuotaKind,
        amount: u64,
    ) -> GatewayResult<QuotaDecision> {
        let key = CacheKeys::quota(api_key_id, &kind.to_string());

        for warmed in [false, true] {
            let reply = self
                .scripts
                .eval(names::QUOTA_CHECK, &[key.clone()], &[amount.to_string()])
                .await?;
            match reply.first().copied().unwrap_or(0) {
                1 => {
                    return Ok(QuotaDecision {
                        allowed: true,
                        remaining: reply.get(1).copied().unwrap_or(0).max(0) as u64,
                    });
                }
                0 => {
                    return Ok(QuotaDecision {
                        allowed: false,
                        remaining: reply.get(1).copied().unwrap_or(0).max(0) as u64,
                    });
                }
                _ if !warmed => {
                    let Some(record) = self.repo.get(api_key_id, kind).await? else {
                        // No configured quota of this kind: allow.
                        return Ok(QuotaDecision { allowed: true, remaining: u64::MAX });
                    };
                    debug!(api_key_id, %kind, remaining = record.remaining(), "warming quota counter");
                    self.kv
                        .set(&key, &record.remaining().to_string(), None)
                        .await?;
                }
                _ => break,
            }
        }
        Err(GatewayError::Kv("quota counter failed to warm".into()))
    }

    /// Refund a previously decremented amount, at most once per trace id.
    /// Used when the upstream call fails fatally after the quota check.
    pub async fn refund(
        &self,
        api_key_id: &str,
        kind: QuotaKind,
        amount: u64,
        trace_id: &str,
    ) -> GatewayResult<bool> {
        let reply = self
            .scripts
            .eval(
                names::QUOTA_REFUND,
                &[
                    CacheKeys::quota(api_key_id, &kind.to_string()),
                    CacheKeys::quota_refund_marker(trace_id),
                ],
                &[amount.to_string(), "3600".to_string()],
            )
            .await?;
        let refunded = reply.first().copied().unwrap_or(0) == 1;
        if refunded {
            self.repo.refund(api_key_id, kind, amount).await?;
        }
        Ok(refunded)
    }

    /// Durable usage write-behind dispatched by the billing step.
    pub async fn record_usage(
        &self,
        api_key_id: &str,
        kind: QuotaKind,
        amount: u64,
    ) -> GatewayResult<()> {
        self.repo.record_usage(api_key_id, kind, amount).await
    }
}
