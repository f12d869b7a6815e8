//! Sliding-window RPM and token-bucket TPM enforcement.
//!
//! RPM runs first; a denial there never consults TPM. Whitelisted keys
//! bypass both at step entry. The decision values land in the context so
//! the response carries `X-RateLimit-*` headers and `Retry-After`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::GatewayError;
use crate::limit::RateLimiter;
use crate::utils::estimate_tokens;

const RPM_WINDOW_SECONDS: u64 = 60;

pub struct RateLimitStep {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStep {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    fn requested_tokens(ctx: &WorkflowContext) -> u64 {
        let validated = ctx.get("validation", "validated");
        let prompt: u64 = validated
            .and_then(|v| v.get("messages"))
            .and_then(serde_json::Value::as_array)
            .map(|msgs| {
                msgs.iter()
                    .map(|m| {
                        m.get("content")
                            .and_then(serde_json::Value::as_str)
                            .map(estimate_tokens)
                            .unwrap_or(0)
                    })
                    .sum()
            })
            .unwrap_or(0);
        let completion = validated
            .and_then(|v| v.get("max_tokens"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        (prompt + completion).max(1)
    }
}

#[async_trait]
impl Step for RateLimitStep {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["validation", "signature_verify"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        let subject = match (&ctx.api_key_id, &ctx.user_id) {
            (Some(key), _) => key.clone(),
            (None, Some(user)) => user.clone(),
            (None, None) => return StepResult::skipped("no_subject"),
        };

        let whitelisted = ctx
            .get("signature_verify", "is_whitelist")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if whitelisted {
            ctx.set("rate_limit", "rpm_remaining", json!(u64::MAX));
            ctx.set("rate_limit", "tpm_remaining", json!(u64::MAX));
            return StepResult::success_with(json!({"bypass": "whitelist"}));
        }

        let limits = ctx.api_key.as_ref().map(|k| k.limits).unwrap_or_default();

        if let Some(rpm) = limits.rpm {
            let decision = match self
                .limiter
                .check_rpm(&subject, rpm, RPM_WINDOW_SECONDS)
                .await
            {
                Ok(d) => d,
                Err(err) => return StepResult::fail_with(ctx, err),
            };
            ctx.set("rate_limit", "rpm_remaining", json!(decision.remaining));
            ctx.set("rate_limit", "reset_seconds", json!(RPM_WINDOW_SECONDS));
            if !decision.allowed {
                ctx.set("rate_limit", "retry_after", json!(decision.retry_after));
                return StepResult::fail_with(
                    ctx,
                    GatewayError::RateLimited { retry_after: decision.retry_after },
                );
            }
        }

        if let Some(tpm) = limits.tpm {
            let requested = Self::requested_tokens(ctx);
            let decision = match self.limiter.check_tpm(&subject, tpm, requested).await {
                Ok(d) => d,
                Err(err) => return StepResult::fail_with(ctx, err),
            };
            ctx.set("rate_limit", "tpm_remaining", json!(decision.remaining));
            if !decision.allowed {
                ctx.set("rate_limit", "retry_after", json!(decision.retry_after));
                return StepResult::fail_with(
                    ctx,
                    GatewayError::RateLimited { retry_after: decision.retry_after },
                );
            }
        }

        StepResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KvStore, MemoryStore, ScriptSet};
    use crate::engine::StepStatus;
    use crate::repo::ApiKeyRecord;
    use crate::types::{Capability, Channel, LimitConfig};
    use chrono::Utc;
    use serde_json::json;

    async fn step() -> RateLimitStep {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let scripts = Arc::new(ScriptSet::register(kv).await.unwrap());
        RateLimitStep::new(Arc::new(RateLimiter::new(scripts)))
    }

    fn ctx(limits: LimitConfig, whitelisted: bool) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        ctx.api_key_id = Some("ak-1".into());
        ctx.api_key = Some(ApiKeyRecord {
            id: "ak-1".into(),
            tenant_id: None,
            user_id: "u-1".into(),
            key_hash: "kh".into(),
            secret_hash: "sh".into(),
            secret_hint: "hint".into(),
            disabled: false,
            whitelist_ips: vec![],
            allowed_ips: vec![],
            allowed_models: vec![],
            limits,
            created_at: Utc::now(),
        });
        ctx.set("signature_verify", "is_whitelist", json!(whitelisted));
        ctx.set(
            "validation",
            "validated",
            json!({"model": "gpt-4", "max_tokens": 20,
                   "messages": [{"role": "user", "content": "hi"}]}),
        );
        ctx
    }

    #[tokio::test]
    async fn second_request_with_rpm_one_is_denied() {
        let step = step().await;
        let limits = LimitConfig { rpm: Some(1), tpm: None };

        let mut first = ctx(limits, false);
        assert_eq!(step.execute(&mut first).await.status, StepStatus::Success);
        assert_eq!(first.get("rate_limit", "rpm_remaining"), Some(&json!(0)));

        let mut second = ctx(limits, false);
        let result = step.execute(&mut second).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(second.error_code.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(second.status_code(), 429);
        let retry = second
            .get("rate_limit", "retry_after")
            .and_then(serde_json::Value::as_u64)
            .unwrap();
        assert!(retry >= 1);
    }

    #[tokio::test]
    async fn whitelist_bypasses_both_checks() {
        let step = step().await;
        let limits = LimitConfig { rpm: Some(0), tpm: Some(0) };
        let mut c = ctx(limits, true);
        assert_eq!(step.execute(&mut c).await.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn tpm_denial_reports_retry_after() {
        let step = step().await;
        let limits = LimitConfig { rpm: Some(100), tpm: Some(10) };
        let mut c = ctx(limits, false);
        // estimated ~21 tokens > bucket capacity 10
        let result = step.execute(&mut c).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(c.get("rate_limit", "retry_after").is_some());
    }
}
