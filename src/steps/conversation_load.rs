//! History loading for internal chat.
//!
//! Prepends the session's recent messages to the outgoing message list so
//! upstreams see the conversation, not just the newest turn.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::conversation::ConversationService;
use crate::engine::{Step, StepResult, WorkflowContext};
use crate::types::Capability;

const DEFAULT_HISTORY_LIMIT: usize = 40;

pub struct ConversationLoadStep {
    conversations: Arc<ConversationService>,
}

impl ConversationLoadStep {
    pub fn new(conversations: Arc<ConversationService>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl Step for ConversationLoadStep {
    fn name(&self) -> &'static str {
        "conversation_load"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["validation"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if ctx.capability != Capability::Chat || ctx.is_external() {
            return StepResult::skipped("not_internal_chat");
        }
        let Some(session_id) = ctx
            .get("validation", "validated")
            .and_then(|v| v.get("session_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return StepResult::skipped("no_session");
        };

        let history = match self
            .conversations
            .load_history(&session_id, DEFAULT_HISTORY_LIMIT)
            .await
        {
            Ok(h) => h,
            Err(err) => return StepResult::fail_with(ctx, err),
        };
        if history.is_empty() {
            return StepResult::success_with(json!({"history": 0}));
        }

        let history_values: Vec<Value> = history
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.to_string(),
                    "content": m.content.as_str().map(str::to_string)
                        .unwrap_or_else(|| m.content.to_string()),
                })
            })
            .collect();
        let count = history_values.len();

        if let Some(validated) = ctx.get("validation", "validated").cloned() {
            let mut merged = validated;
            if let Some(current) = merged.get("messages").and_then(Value::as_array).cloned() {
                let mut all = history_values;
                all.extend(current);
                merged["messages"] = Value::Array(all);
            }
            ctx.set("validation", "validated", merged);
        }
        ctx.set("conversation", "history_count", json!(count));
        ctx.set("conversation", "session_id", json!(session_id));
        StepResult::success_with(json!({"history": count}))
    }
}
