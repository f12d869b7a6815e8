//! Billing: token counters × pricing config, idempotent per request.
//!
//! Runs as an independent tail so partially delivered streams still bill
//! the frames the client received. Usage recording is dispatched as a
//! background task that settles quota counters in KV and the repository.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use crate::cache::{CacheKeys, KvStore};
use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::QuotaKind;
use crate::limit::QuotaEnforcer;
use crate::types::{BillingInfo, Usage};

const BILLING_MARKER_TTL: std::time::Duration = std::time::Duration::from_secs(86400);

pub struct BillingStep {
    quotas: Arc<QuotaEnforcer>,
    kv: Arc<dyn KvStore>,
}

impl BillingStep {
    pub fn new(quotas: Arc<QuotaEnforcer>, kv: Arc<dyn KvStore>) -> Self {
        Self { quotas, kv }
    }

    fn usage_of(ctx: &WorkflowContext) -> Option<Usage> {
        let raw = ctx
            .get("response_transform", "usage")
            .or_else(|| ctx.get("upstream_call", "usage"))?;
        serde_json::from_value(raw.clone()).ok()
    }
}

#[async_trait]
impl Step for BillingStep {
    fn name(&self) -> &'static str {
        "billing"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        let Some(usage) = Self::usage_of(ctx) else {
            // Nothing reached an upstream; nothing to bill.
            return StepResult::skipped("no_usage");
        };
        let Some(candidate) = ctx.candidates.first() else {
            return StepResult::skipped("no_candidate");
        };
        let pricing = candidate.pricing;

        let idempotency_key = ctx
            .get("validation", "validated")
            .and_then(|v| v.get("idempotency_key"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| ctx.trace_id.clone());
        let marker = CacheKeys::billing_marker(&idempotency_key);
        let fresh = self
            .kv
            .set_nx(&marker, &ctx.trace_id, BILLING_MARKER_TTL)
            .await
            .unwrap_or(true);

        let cached_input = usage.cache_read_tokens.unwrap_or(0).min(usage.prompt_tokens);
        let fresh_input = usage.prompt_tokens - cached_input;
        let mut input_cost = fresh_input as f64 / 1000.0 * pricing.input_per_1k;
        if let Some(cache_rate) = pricing.cache_read_per_1k {
            input_cost += cached_input as f64 / 1000.0 * cache_rate;
        } else {
            input_cost += cached_input as f64 / 1000.0 * pricing.input_per_1k;
        }
        let output_cost = usage.completion_tokens as f64 / 1000.0 * pricing.output_per_1k;
        let mut total_cost = input_cost + output_cost;
        if let Some(per_call) = pricing.image_per_call {
            if ctx.capability == crate::types::Capability::Image {
                total_cost += per_call;
            }
        }
        if let Some(per_second) = pricing.audio_per_second {
            if matches!(
                ctx.capability,
                crate::types::Capability::SpeechToText | crate::types::Capability::TextToSpeech
            ) {
                // Transcription-style responses report their length.
                let seconds = ctx
                    .get("upstream_call", "raw_response")
                    .and_then(|r| r.get("duration"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                total_cost += per_second * seconds;
            }
        }

        let billing = BillingInfo {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            input_cost,
            output_cost,
            total_cost,
            cache_hit: cached_input > 0,
        };
        ctx.set("billing", "summary", json!(billing));
        ctx.set("billing", "recorded", json!(fresh));
        ctx.billing = Some(billing);

        if !fresh {
            // A retried request with the same idempotency key keeps the
            // original record; no second usage dispatch.
            return StepResult::success_with(json!({"deduplicated": true}));
        }

        if let Some(api_key_id) = ctx.api_key_id.clone() {
            let quotas = self.quotas.clone();
            let total_tokens = usage.total_tokens;
            let estimated = ctx
                .get("quota_check", "decremented_token")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::spawn(async move {
                if let Err(e) = quotas
                    .record_usage(&api_key_id, QuotaKind::Token, total_tokens)
                    .await
                {
                    warn!(api_key_id, error = %e, "token usage recording failed");
                }
                if let Err(e) = quotas.record_usage(&api_key_id, QuotaKind::Request, 1).await {
                    warn!(api_key_id, error = %e, "request usage recording failed");
                }
                // True-up the KV counter when actual use exceeded the
                // pre-check estimate.
                if total_tokens > estimated {
                    let _ = quotas
                        .check_and_decrement(
                            &api_key_id,
                            QuotaKind::Token,
                            total_tokens - estimated,
                        )
                        .await;
                }
            });
        }

        StepResult::success()
    }
}
