//! Per-key quota pre-check.
//!
//! Request and token quotas are checked and decremented up front (tokens
//! by estimate); cost settles post-billing. The amounts decremented here
//! are remembered so a fatal upstream failure can refund them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::{GatewayError, QuotaKind};
use crate::limit::QuotaEnforcer;
use crate::utils::estimate_tokens;

pub struct QuotaCheckStep {
    quotas: Arc<QuotaEnforcer>,
}

impl QuotaCheckStep {
    pub fn new(quotas: Arc<QuotaEnforcer>) -> Self {
        Self { quotas }
    }

    fn estimate_request_tokens(ctx: &WorkflowContext) -> u64 {
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
                            + 4
                    })
                    .sum()
            })
            .unwrap_or(0);
        let completion = validated
            .and_then(|v| v.get("max_tokens"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(256);
        prompt + completion
    }
}

#[async_trait]
impl Step for QuotaCheckStep {
    fn name(&self) -> &'static str {
        "quota_check"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["validation", "signature_verify"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        let Some(api_key_id) = ctx.api_key_id.clone() else {
            return StepResult::skipped("no_api_key");
        };

        let token_estimate = Self::estimate_request_tokens(ctx);
        let checks = [(QuotaKind::Request, 1u64), (QuotaKind::Token, token_estimate)];

        for (kind, amount) in checks {
            let decision = match self.quotas.check_and_decrement(&api_key_id, kind, amount).await {
                Ok(d) => d,
                Err(err) => return StepResult::fail_with(ctx, err),
            };
            if !decision.allowed {
                ctx.set("quota_check", "denied_kind", json!(kind.to_string()));
                return StepResult::fail_with(ctx, GatewayError::QuotaExceeded { kind });
            }
            ctx.set(
                "quota_check",
                &format!("decremented_{kind}"),
                json!(amount),
            );
            ctx.set(
                "quota_check",
                &format!("remaining_{kind}"),
                json!(decision.remaining),
            );
        }
        StepResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KvStore, MemoryStore, ScriptSet};
    use crate::engine::StepStatus;
    use crate::repo::MemoryQuotas;
    use crate::types::{Capability, Channel, QuotaRecord};
    use chrono::Utc;
    use serde_json::json;

    async fn step_with(records: Vec<QuotaRecord>) -> QuotaCheckStep {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let scripts = Arc::new(ScriptSet::register(kv.clone()).await.unwrap());
        let quotas = Arc::new(MemoryQuotas::new());
        for r in records {
            quotas.seed(r);
        }
        QuotaCheckStep::new(Arc::new(QuotaEnforcer::new(kv, scripts, quotas)))
    }

    fn ctx() -> WorkflowContext {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        ctx.api_key_id = Some("ak-1".into());
        ctx.set(
            "validation",
            "validated",
            json!({"model": "gpt-4", "max_tokens": 10,
                   "messages": [{"role": "user", "content": "hi"}]}),
        );
        ctx
    }

    fn record(kind: QuotaKind, total: u64, used: u64) -> QuotaRecord {
        QuotaRecord {
            api_key_id: "ak-1".into(),
            kind,
            total,
            used,
            reset_period_seconds: 86400,
            period_start: Utc::now(),
        }
    }

    #[tokio::test]
    async fn exhausted_request_quota_denies_with_kind() {
        let step = step_with(vec![record(QuotaKind::Request, 10, 10)]).await;
        let mut c = ctx();
        let result = step.execute(&mut c).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(c.error_code.as_deref(), Some("QUOTA_EXCEEDED"));
        assert_eq!(c.error_source, Some(crate::error::ErrorSource::Policy));
        assert_eq!(c.get("quota_check", "denied_kind"), Some(&json!("request")));
    }

    #[tokio::test]
    async fn passing_checks_record_decrements() {
        let step = step_with(vec![
            record(QuotaKind::Request, 10, 0),
            record(QuotaKind::Token, 10_000, 0),
        ])
        .await;
        let mut c = ctx();
        let result = step.execute(&mut c).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(c.get("quota_check", "decremented_request"), Some(&json!(1)));
        assert!(
            c.get("quota_check", "decremented_token")
                .and_then(serde_json::Value::as_u64)
                .unwrap()
                >= 10
        );
    }

    #[tokio::test]
    async fn no_key_id_skips() {
        let step = step_with(vec![]).await;
        let mut c = WorkflowContext::new(Channel::Internal, Capability::Chat);
        let result = step.execute(&mut c).await;
        assert_eq!(result.status, StepStatus::Skipped);
    }
}
