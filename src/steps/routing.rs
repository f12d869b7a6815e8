//! Routing step: candidate selection with failover ordering.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::engine::{FailureAction, Step, StepResult, WorkflowContext};
use crate::error::GatewayError;
use crate::routing::RoutingSelector;
use crate::types::ChatMessage;

pub struct RoutingStep {
    selector: Arc<RoutingSelector>,
}

impl RoutingStep {
    pub fn new(selector: Arc<RoutingSelector>) -> Self {
        Self { selector }
    }

    fn messages_of(validated: &Value) -> Vec<ChatMessage> {
        validated
            .get("messages")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Step for RoutingStep {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["validation", "quota_check", "rate_limit"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        let Some(model) = ctx.requested_model.clone() else {
            return StepResult::fail_with(
                ctx,
                GatewayError::BadRequest("no model to route".into()),
            );
        };
        let validated = ctx
            .get("validation", "validated")
            .cloned()
            .unwrap_or(Value::Null);

        let selection = match self
            .selector
            .select(
                &model,
                ctx.capability,
                ctx.channel,
                ctx.user_id.as_deref(),
                &validated,
                &Self::messages_of(&validated),
            )
            .await
        {
            Ok(s) => s,
            Err(err) => return StepResult::fail_with(ctx, err),
        };

        let primary = &selection.candidates[0];
        ctx.set("routing", "provider", json!(primary.provider));
        ctx.set("routing", "instance_id", json!(primary.instance_id));
        ctx.set("routing", "upstream_model", json!(primary.upstream_model));
        ctx.set("routing", "candidate_count", json!(selection.candidates.len()));
        ctx.affinity_hit = selection.affinity_hit;
        ctx.candidates = selection.candidates;

        StepResult::success_with(json!({"candidates": ctx.candidates.len()}))
    }

    fn on_failure(&self, ctx: &WorkflowContext, attempt: u32) -> FailureAction {
        // Transient repository hiccups deserve one retry; a candidate
        // drought does not.
        if ctx.error_code.as_deref() == Some("NO_AVAILABLE_UPSTREAM") || attempt >= 2 {
            FailureAction::Abort
        } else {
            FailureAction::Retry
        }
    }
}
