//! Conversation persistence for internal chat.
//!
//! Reserves turn indexes atomically, persists the user message and the
//! assistant answer in one transaction, and pokes the idle-summary
//! scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::conversation::{ConversationService, SummaryScheduler};
use crate::engine::{Step, StepResult, WorkflowContext};
use crate::types::{Capability, ConversationMessage, Role};
use crate::utils::estimate_tokens;

pub struct ConversationAppendStep {
    conversations: Arc<ConversationService>,
    summaries: Arc<SummaryScheduler>,
}

impl ConversationAppendStep {
    pub fn new(conversations: Arc<ConversationService>, summaries: Arc<SummaryScheduler>) -> Self {
        Self { conversations, summaries }
    }

    fn assistant_text(ctx: &WorkflowContext) -> Option<String> {
        // Streamed answers accumulate under upstream_call; JSON answers sit
        // in the canonical response.
        if let Some(content) = ctx
            .get("upstream_call", "content")
            .and_then(Value::as_str)
        {
            if !content.is_empty() {
                return Some(content.to_string());
            }
        }
        ctx.response()
            .and_then(|r| r.pointer("/choices/0/message/content"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn user_text(ctx: &WorkflowContext) -> Option<String> {
        ctx.get("validation", "validated")
            .and_then(|v| v.get("messages"))
            .and_then(Value::as_array)
            .and_then(|msgs| {
                msgs.iter()
                    .rev()
                    .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            })
            .and_then(|m| m.get("content").and_then(Value::as_str))
            .map(str::to_string)
    }
}

#[async_trait]
impl Step for ConversationAppendStep {
    fn name(&self) -> &'static str {
        "conversation_append"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["response_transform"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if ctx.capability != Capability::Chat || ctx.is_external() {
            return StepResult::skipped("not_internal_chat");
        }
        if !ctx.success {
            return StepResult::skipped("request_failed");
        }
        let Some(session_id) = ctx
            .get("validation", "validated")
            .and_then(|v| v.get("session_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return StepResult::skipped("no_session");
        };

        let session = match self.conversations.get_session(&session_id).await {
            Ok(s) => s,
            Err(err) => return StepResult::fail_with(ctx, err),
        };
        let persona = session.assistant_id.clone();

        let mut messages = Vec::with_capacity(2);
        if let Some(user_text) = Self::user_text(ctx) {
            let mut m = ConversationMessage::text(&session_id, 0, Role::User, user_text.clone());
            m.token_estimate = estimate_tokens(&user_text);
            m.used_persona_id = persona.clone();
            messages.push(m);
        }
        let Some(assistant_text) = Self::assistant_text(ctx) else {
            return StepResult::skipped("no_assistant_content");
        };
        let mut m = ConversationMessage::text(&session_id, 0, Role::Assistant, assistant_text.clone());
        m.token_estimate = estimate_tokens(&assistant_text);
        m.used_persona_id = persona;
        messages.push(m);

        let first = match self.conversations.append_exchange(&session_id, messages).await {
            Ok(first) => first,
            Err(err) => return StepResult::fail_with(ctx, err),
        };

        self.summaries.touch_session(&session_id).await;
        ctx.set("conversation_append", "first_turn", json!(first));
        StepResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KvStore, MemoryStore, ScriptSet};
    use crate::config::GatewayConfig;
    use crate::engine::StepStatus;
    use crate::repo::{ConversationRepository, MemoryConversations};
    use crate::types::{Channel, ConversationSession};

    async fn fixture() -> (ConversationAppendStep, Arc<MemoryConversations>) {
        let repo = Arc::new(MemoryConversations::new());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let scripts = Arc::new(ScriptSet::register(kv.clone()).await.unwrap());
        let conversations = Arc::new(ConversationService::new(
            repo.clone(),
            kv.clone(),
            scripts,
            &GatewayConfig::default(),
        ));
        let (summaries, _jobs) = SummaryScheduler::new(kv, &GatewayConfig::default());
        (ConversationAppendStep::new(conversations, summaries), repo)
    }

    #[tokio::test]
    async fn persists_exchange_with_persona_annotation() {
        let (step, repo) = fixture().await;
        let mut session = ConversationSession::new("s1", "u1", Channel::Internal);
        session.assistant_id = Some("persona-7".into());
        repo.upsert_session(&session).await.unwrap();

        let mut ctx = WorkflowContext::new(Channel::Internal, Capability::Chat);
        ctx.set(
            "validation",
            "validated",
            serde_json::json!({
                "model": "gpt-4", "session_id": "s1",
                "messages": [{"role": "user", "content": "what is rust"}]
            }),
        );
        ctx.set_response(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "a language"}}]
        }));

        let result = step.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);

        let history = repo.recent_messages("s1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].turn_index, 1);
        assert_eq!(history[1].turn_index, 2);
        assert_eq!(history[1].used_persona_id.as_deref(), Some("persona-7"));
        let session = repo.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.message_count, 2);
        assert!(session.last_active_at.is_some());
    }

    #[tokio::test]
    async fn failed_request_does_not_persist() {
        let (step, repo) = fixture().await;
        repo.upsert_session(&ConversationSession::new("s1", "u1", Channel::Internal))
            .await
            .unwrap();
        let mut ctx = WorkflowContext::new(Channel::Internal, Capability::Chat);
        ctx.mark_error(&crate::error::GatewayError::Internal("boom".into()));
        let result = step.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Skipped);
        assert!(repo.recent_messages("s1", 10).await.unwrap().is_empty());
    }
}
