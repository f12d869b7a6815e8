//! Request validation: size ceiling and required fields.

use async_trait::async_trait;

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::error::GatewayError;
use crate::types::Capability;

pub struct ValidationStep {
    max_request_bytes: usize,
}

impl ValidationStep {
    pub fn new(max_request_bytes: usize) -> Self {
        Self { max_request_bytes }
    }
}

#[async_trait]
impl Step for ValidationStep {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["request_adapter"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        // The adapter's canonical form when present, the raw payload
        // otherwise (non-chat capabilities).
        let request = ctx
            .get("validation", "request")
            .cloned()
            .unwrap_or_else(|| ctx.raw_request.clone());

        if request.is_null() {
            return StepResult::fail_with(ctx, GatewayError::BadRequest("empty request".into()));
        }

        let size = serde_json::to_vec(&request).map(|v| v.len()).unwrap_or(0);
        if size > self.max_request_bytes {
            return StepResult::fail_with(
                ctx,
                GatewayError::RequestTooLarge { limit: self.max_request_bytes, actual: size },
            );
        }

        let model = request
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if model.is_empty() {
            return StepResult::fail_with(
                ctx,
                GatewayError::BadRequest("model is required".into()),
            );
        }

        if ctx.capability == Capability::Chat {
            let has_messages = request
                .get("messages")
                .and_then(serde_json::Value::as_array)
                .is_some();
            if !has_messages {
                return StepResult::fail_with(
                    ctx,
                    GatewayError::BadRequest("messages is required".into()),
                );
            }
        }

        ctx.requested_model = Some(model.to_string());
        ctx.set("validation", "validated", request);
        StepResult::success()
    }
}
