//! The upstream call itself: non-streaming with failover, or SSE pumping
//! with mid-stream billing accumulation.
//!
//! On fatal failure the quota amounts decremented by the pre-check are
//! refunded (idempotently, keyed by trace id). On success the winning
//! candidate rotates to the front of the context's candidate list so later
//! steps read the right protocol and pricing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::{GatewayError, QuotaKind};
use crate::limit::QuotaEnforcer;
use crate::routing::AffinityTracker;
use crate::types::{ChatMessage, UpstreamResult};
use crate::upstream::{UpstreamCaller, pump_sse};
use crate::utils::estimate_tokens;

pub struct UpstreamCallStep {
    caller: Arc<UpstreamCaller>,
    affinity: Arc<AffinityTracker>,
    quotas: Arc<QuotaEnforcer>,
    idle_timeout: Duration,
}

impl UpstreamCallStep {
    pub fn new(
        caller: Arc<UpstreamCaller>,
        affinity: Arc<AffinityTracker>,
        quotas: Arc<QuotaEnforcer>,
        idle_timeout: Duration,
    ) -> Self {
        Self { caller, affinity, quotas, idle_timeout }
    }

    fn prompt_estimate(validated: &Value) -> u64 {
        validated
            .get("messages")
            .and_then(Value::as_array)
            .map(|msgs| {
                msgs.iter()
                    .map(|m| {
                        m.get("content")
                            .and_then(Value::as_str)
                            .map(estimate_tokens)
                            .unwrap_or(0)
                            + 4
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    fn messages_of(validated: &Value) -> Vec<ChatMessage> {
        validated
            .get("messages")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    async fn refund_quotas(&self, ctx: &WorkflowContext) {
        let Some(api_key_id) = &ctx.api_key_id else { return };
        for kind in [QuotaKind::Request, QuotaKind::Token] {
            let Some(amount) = ctx
                .get("quota_check", &format!("decremented_{kind}"))
                .and_then(Value::as_u64)
            else {
                continue;
            };
            let marker = format!("{}:{kind}", ctx.trace_id);
            if let Err(e) = self.quotas.refund(api_key_id, kind, amount, &marker).await {
                warn!(api_key_id, %kind, error = %e, "quota refund failed");
            }
        }
    }

    fn rotate_winner(ctx: &mut WorkflowContext, arm_id: &str) {
        if let Some(pos) = ctx.candidates.iter().position(|c| c.arm_id() == arm_id) {
            if pos > 0 {
                let winner = ctx.candidates.remove(pos);
                ctx.candidates.insert(0, winner);
            }
        }
    }

    async fn record_affinity(&self, ctx: &WorkflowContext, arm_id: &str) {
        let Some(model) = &ctx.requested_model else { return };
        let Some(validated) = ctx.get("validation", "validated") else { return };
        let messages = Self::messages_of(validated);
        if messages.is_empty() {
            return;
        }
        if let Err(e) = self.affinity.record(model, &messages, arm_id).await {
            debug!(error = %e, "affinity record failed");
        }
    }
}

#[async_trait]
impl Step for UpstreamCallStep {
    fn name(&self) -> &'static str {
        "upstream_call"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["template_render", "quota_check", "rate_limit"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if ctx.rendered.is_empty() {
            return StepResult::fail_with(
                ctx,
                GatewayError::Internal("upstream call before template render".into()),
            );
        }

        let validated = ctx
            .get("validation", "validated")
            .cloned()
            .unwrap_or(Value::Null);
        let streaming = ctx.wants_stream() && ctx.stream_sender.is_some();

        if streaming {
            self.execute_stream(ctx, &validated).await
        } else {
            self.execute_json(ctx, &validated).await
        }
    }
}

impl UpstreamCallStep {
    async fn execute_json(&self, ctx: &mut WorkflowContext, validated: &Value) -> StepResult {
        let rendered = std::mem::take(&mut ctx.rendered);
        let result = self.caller.call_json(&rendered, &ctx.cancel).await;
        ctx.rendered = rendered;

        match result {
            Ok(outcome) => {
                let arm_id = outcome.candidate.arm_id().to_string();
                ctx.upstream_result = Some(UpstreamResult {
                    provider: outcome.candidate.provider.clone(),
                    instance_id: outcome.candidate.instance_id.clone(),
                    model: outcome.candidate.upstream_model.clone(),
                    status_code: Some(outcome.status),
                    error_code: None,
                    latency_ms: outcome.latency_ms,
                    attempts: outcome.attempts,
                });
                ctx.set("upstream_call", "raw_response", outcome.body);
                ctx.set("upstream_call", "stream", json!(false));
                ctx.set("upstream_call", "attempts", json!(outcome.attempts));
                Self::rotate_winner(ctx, &arm_id);
                self.record_affinity(ctx, &arm_id).await;
                StepResult::success()
            }
            Err(err) => {
                ctx.upstream_result = Some(UpstreamResult {
                    provider: ctx
                        .candidates
                        .first()
                        .map(|c| c.provider.clone())
                        .unwrap_or_default(),
                    instance_id: ctx
                        .candidates
                        .first()
                        .map(|c| c.instance_id.clone())
                        .unwrap_or_default(),
                    model: ctx.requested_model.clone().unwrap_or_default(),
                    status_code: None,
                    error_code: Some(err.code().to_string()),
                    latency_ms: 0,
                    attempts: ctx.rendered.len() as u32,
                });
                self.refund_quotas(ctx).await;
                StepResult::fail_with(ctx, err)
            }
        }
    }

    async fn execute_stream(&self, ctx: &mut WorkflowContext, validated: &Value) -> StepResult {
        let rendered = std::mem::take(&mut ctx.rendered);
        let opened = match self.caller.call_stream(&rendered, &ctx.cancel).await {
            Ok(o) => o,
            Err(err) => {
                ctx.rendered = rendered;
                self.refund_quotas(ctx).await;
                return StepResult::fail_with(ctx, err);
            }
        };
        ctx.rendered = rendered;

        let candidate = opened.candidate.clone();
        let prompt_estimate = Self::prompt_estimate(validated);
        let model = candidate.upstream_model.clone();
        let started = std::time::Instant::now();

        let outcome = pump_sse(
            opened.response,
            &candidate.protocol,
            &candidate.response_transform,
            ctx.stream_sender.as_ref(),
            &ctx.cancel,
            self.idle_timeout,
            &ctx.trace_id,
            &model,
            prompt_estimate,
        )
        .await;

        let latency_ms = opened.first_byte_latency_ms + started.elapsed().as_millis() as u64;
        let clean = outcome.error.is_none();
        self.caller.finish_stream(&candidate, clean, latency_ms).await;

        let totals = outcome.totals;
        ctx.set("upstream_call", "stream", json!(true));
        ctx.set("upstream_call", "frames", json!(totals.frames));
        ctx.set("upstream_call", "usage", json!(totals.usage));
        ctx.set("upstream_call", "content", json!(totals.content));
        if !totals.tool_calls.is_empty() {
            ctx.set(
                "upstream_call",
                "tool_calls",
                serde_json::to_value(&totals.tool_calls).unwrap_or(Value::Null),
            );
        }
        if let Some(reason) = &totals.finish_reason {
            ctx.set("upstream_call", "finish_reason", json!(reason.as_str()));
        }
        ctx.upstream_result = Some(UpstreamResult {
            provider: candidate.provider.clone(),
            instance_id: candidate.instance_id.clone(),
            model: model.clone(),
            status_code: Some(200),
            error_code: outcome.error.as_ref().map(|e| e.code().to_string()),
            latency_ms,
            attempts: opened.attempts,
        });

        match outcome.error {
            None => {
                self.record_affinity(ctx, candidate.arm_id()).await;
                StepResult::success()
            }
            Some(err) => {
                // Delivered frames are billed; the client already got a
                // terminating error frame. No refund for the tokens spent.
                debug!(trace_id = %ctx.trace_id, frames = totals.frames, "stream ended abnormally");
                StepResult::fail_with(ctx, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KvStore, MemoryStore, ScriptSet};
    use crate::config::GatewayConfig;
    use crate::engine::StepStatus;
    use crate::repo::{BanditRepository, MemoryBanditArms, MemoryQuotas};
    use crate::template::RenderedRequest;
    use crate::types::{
        AuthConfig, AuthType, BanditArmState, Capability, Channel, ProtocolKind,
        UpstreamCandidate,
    };
    use crate::upstream::{CircuitBreaker, SsrfGuard};
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidate(arm: &str, base_url: &str) -> UpstreamCandidate {
        UpstreamCandidate {
            preset_id: "p".into(),
            instance_id: format!("inst-{arm}"),
            model_id: "m".into(),
            upstream_model: "gpt-4".into(),
            credential_ref: "r".into(),
            provider: "openai".into(),
            base_url: base_url.into(),
            upstream_path: "chat/completions".into(),
            protocol: ProtocolKind::OpenAi,
            auth_type: AuthType::Bearer,
            auth_config: AuthConfig::default(),
            default_headers: HashMap::new(),
            default_params: HashMap::new(),
            template_engine: Default::default(),
            request_template: Value::Null,
            response_transform: Default::default(),
            pricing: Default::default(),
            limits: Default::default(),
            routing: Default::default(),
            capability_config: Default::default(),
            auto_append_v1: Some(false),
            weight: 1,
            priority: 1,
            enabled: true,
            arm: BanditArmState::fresh(arm),
        }
    }

    fn rendered(url: &str) -> RenderedRequest {
        RenderedRequest {
            url: format!("{url}/chat/completions"),
            query: vec![],
            headers: HashMap::new(),
            body: json!({"model": "gpt-4", "messages": [{"role":"user","content":"hi"}]}),
        }
    }

    async fn step(bandit: Arc<MemoryBanditArms>) -> UpstreamCallStep {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let scripts = Arc::new(ScriptSet::register(kv.clone()).await.unwrap());
        let mut cfg = GatewayConfig::default();
        cfg.allow_internal_networks = true; // wiremock binds loopback
        let caller = UpstreamCaller::new(
            SsrfGuard::new(&cfg),
            CircuitBreaker::new(kv.clone(), &cfg),
            bandit,
            &cfg,
        )
        .unwrap();
        let affinity = Arc::new(AffinityTracker::new(
            kv.clone(),
            0.5,
            Duration::from_secs(60),
        ));
        let quotas = Arc::new(QuotaEnforcer::new(
            kv,
            scripts,
            Arc::new(MemoryQuotas::new()),
        ));
        UpstreamCallStep::new(Arc::new(caller), affinity, quotas, Duration::from_secs(5))
    }

    fn ctx_for(pairs: Vec<(UpstreamCandidate, RenderedRequest)>) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        ctx.requested_model = Some("gpt-4".into());
        ctx.set(
            "validation",
            "validated",
            json!({"model": "gpt-4", "messages": [{"role":"user","content":"hi"}]}),
        );
        ctx.candidates = pairs.iter().map(|(c, _)| c.clone()).collect();
        ctx.rendered = pairs;
        ctx
    }

    #[tokio::test]
    async fn failover_walks_to_second_candidate_and_books_arms() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&bad)
            .await;
        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1", "object": "chat.completion", "created": 1,
                "model": "gpt-4",
                "choices": [{"index": 0,
                             "message": {"role": "assistant", "content": "pong"},
                             "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
            })))
            .mount(&good)
            .await;

        let bandit = Arc::new(MemoryBanditArms::new());
        bandit.seed(BanditArmState::fresh("arm-a"));
        bandit.seed(BanditArmState::fresh("arm-b"));

        let s = step(bandit.clone()).await;
        let mut ctx = ctx_for(vec![
            (candidate("arm-a", &bad.uri()), rendered(&bad.uri())),
            (candidate("arm-b", &good.uri()), rendered(&good.uri())),
        ]);

        let result = s.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(ctx.upstream_result.as_ref().unwrap().attempts, 2);
        // Winner rotated to the front for later steps.
        assert_eq!(ctx.candidates[0].arm_id(), "arm-b");

        let arm_a = bandit.get_arm("arm-a").await.unwrap().unwrap();
        let arm_b = bandit.get_arm("arm-b").await.unwrap().unwrap();
        assert_eq!(arm_a.failures, 1);
        assert_eq!(arm_b.successes, 1);
        assert_eq!(arm_a.total_trials, arm_a.successes + arm_a.failures);
        assert_eq!(arm_b.total_trials, arm_b.successes + arm_b.failures);
    }

    #[tokio::test]
    async fn non_retryable_4xx_stops_failover() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&bad)
            .await;
        let second = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unused": true})))
            .expect(0)
            .mount(&second)
            .await;

        let s = step(Arc::new(MemoryBanditArms::new())).await;
        let mut ctx = ctx_for(vec![
            (candidate("arm-a", &bad.uri()), rendered(&bad.uri())),
            (candidate("arm-b", &second.uri()), rendered(&second.uri())),
        ]);

        let result = s.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(ctx.error_code.as_deref(), Some("UPSTREAM_4XX"));
    }
}
