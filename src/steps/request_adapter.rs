//! Inbound protocol adaptation.
//!
//! Chat requests may arrive as OpenAI chat, Anthropic messages, or
//! Responses payloads; all of them fold into the canonical shape before
//! validation. Non-chat capabilities pass through untouched.

use async_trait::async_trait;
use tracing::debug;

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::protocol;
use crate::types::Capability;

pub struct RequestAdapterStep;

#[async_trait]
impl Step for RequestAdapterStep {
    fn name(&self) -> &'static str {
        "request_adapter"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if ctx.capability != Capability::Chat {
            return StepResult::skipped("non_chat");
        }
        if ctx.raw_request.is_null() {
            return StepResult::failed("no request to adapt");
        }

        let canonical = match protocol::adapt_inbound(ctx.dialect, &ctx.raw_request) {
            Ok(req) => req,
            Err(err) => return StepResult::fail_with(ctx, err),
        };

        ctx.requested_model = Some(canonical.model.clone());
        let as_value = match serde_json::to_value(&canonical) {
            Ok(v) => v,
            Err(e) => return StepResult::failed(format!("serialize canonical request: {e}")),
        };
        debug!(
            trace_id = %ctx.trace_id,
            dialect = ?ctx.dialect,
            model = %canonical.model,
            "request adapted"
        );
        ctx.set("validation", "request", as_value);
        StepResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStatus;
    use crate::types::{Channel, InboundDialect};
    use serde_json::json;

    #[tokio::test]
    async fn anthropic_dialect_folds_to_canonical() {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat)
            .with_dialect(InboundDialect::Anthropic)
            .with_request(json!({
                "model": "claude-3-5-sonnet",
                "system": "You are helpful.",
                "messages": [{"role": "user", "content": "hello"}],
                "stream": true
            }));

        let result = RequestAdapterStep.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);

        let adapted = ctx.get("validation", "request").unwrap();
        assert_eq!(adapted["messages"][0]["role"], "system");
        assert_eq!(adapted["messages"][0]["content"], "You are helpful.");
        assert_eq!(adapted["messages"][1]["content"], "hello");
        assert_eq!(adapted["stream"], true);
        assert_eq!(ctx.requested_model.as_deref(), Some("claude-3-5-sonnet"));
    }

    #[tokio::test]
    async fn non_chat_capability_is_skipped() {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Image);
        let result = RequestAdapterStep.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Skipped);
    }
}
