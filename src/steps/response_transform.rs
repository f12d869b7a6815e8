//! Response normalisation to the canonical OpenAI shape.
//!
//! Stream mode already emitted OpenAI-style chunks frame by frame, so this
//! step only surfaces the accumulated usage there. Non-streaming responses
//! are folded through the winning candidate's protocol mapper.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::GatewayError;
use crate::protocol;

pub struct ResponseTransformStep;

#[async_trait]
impl Step for ResponseTransformStep {
    fn name(&self) -> &'static str {
        "response_transform"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["upstream_call"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        let streamed = ctx
            .get("upstream_call", "stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut headers = serde_json::Map::new();
        headers.insert("X-Request-Id".into(), json!(ctx.trace_id));
        if let Some(remaining) = ctx.get("rate_limit", "rpm_remaining") {
            headers.insert("X-RateLimit-Remaining".into(), remaining.clone());
        }
        if let Some(reset) = ctx.get("rate_limit", "reset_seconds") {
            headers.insert("X-RateLimit-Reset".into(), reset.clone());
        }

        if streamed {
            // Chunks are already canonical; only propagate the totals.
            if let Some(usage) = ctx.get("upstream_call", "usage").cloned() {
                ctx.set("response_transform", "usage", usage);
            }
            ctx.set("response_transform", "mode", json!("stream"));
            ctx.set("response", "headers", Value::Object(headers));
            return StepResult::success();
        }

        let Some(raw) = ctx.get("upstream_call", "raw_response").cloned() else {
            return StepResult::fail_with(
                ctx,
                GatewayError::Internal("no upstream response to transform".into()),
            );
        };
        let Some(candidate) = ctx.candidates.first() else {
            return StepResult::fail_with(
                ctx,
                GatewayError::Internal("no candidate for response transform".into()),
            );
        };

        let canonical = match protocol::normalize_response(&candidate.protocol, &raw) {
            Ok(c) => c,
            Err(err) => return StepResult::fail_with(ctx, err),
        };

        if let Some(usage) = &canonical.usage {
            ctx.set("response_transform", "usage", json!(usage));
        }
        ctx.set("response_transform", "mode", json!("json"));
        ctx.set("response", "headers", Value::Object(headers));
        match serde_json::to_value(&canonical) {
            Ok(v) => ctx.set_response(v),
            Err(e) => return StepResult::failed(format!("serialize canonical response: {e}")),
        }
        StepResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStatus;
    use crate::types::{
        AuthConfig, AuthType, BanditArmState, Capability, Channel, ProtocolKind,
        UpstreamCandidate,
    };
    use std::collections::HashMap;

    fn anthropic_candidate() -> UpstreamCandidate {
        UpstreamCandidate {
            preset_id: "p".into(),
            instance_id: "i".into(),
            model_id: "m".into(),
            upstream_model: "claude-3-5-sonnet".into(),
            credential_ref: "r".into(),
            provider: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            upstream_path: "v1/messages".into(),
            protocol: ProtocolKind::Anthropic,
            auth_type: AuthType::ApiKey,
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
            auto_append_v1: None,
            weight: 1,
            priority: 1,
            enabled: true,
            arm: BanditArmState::fresh("arm"),
        }
    }

    #[tokio::test]
    async fn anthropic_payload_normalises_to_openai_shape() {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        ctx.candidates = vec![anthropic_candidate()];
        ctx.set("rate_limit", "rpm_remaining", json!(9));
        ctx.set(
            "upstream_call",
            "raw_response",
            json!({
                "id": "msg_1",
                "model": "claude-3-5-sonnet",
                "content": [{"type": "text", "text": "Hello!"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 5, "output_tokens": 7}
            }),
        );
        ctx.set("upstream_call", "stream", json!(false));

        let result = ResponseTransformStep.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);

        let response = ctx.response().unwrap();
        assert_eq!(response["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(response["choices"][0]["finish_reason"], "stop");
        assert_eq!(response["usage"]["prompt_tokens"], 5);

        let headers = ctx.get("response", "headers").unwrap();
        assert_eq!(headers["X-RateLimit-Remaining"], 9);
        assert_eq!(headers["X-Request-Id"], json!(ctx.trace_id));
    }

    #[tokio::test]
    async fn stream_mode_only_carries_usage() {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        ctx.set("upstream_call", "stream", json!(true));
        ctx.set(
            "upstream_call",
            "usage",
            json!({"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}),
        );
        let result = ResponseTransformStep.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);
        assert!(ctx.response().is_none());
        assert_eq!(
            ctx.get("response_transform", "usage").unwrap()["completion_tokens"],
            4
        );
    }
}
