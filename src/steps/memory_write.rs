//! Durable-memory extraction for external chat.
//!
//! After a successful exchange, a background task classifies the user
//! message and, when it encodes a durable personal fact, upserts it into
//! the user's vector memory. Task errors are logged, never raised. For
//! streaming requests this step runs after the stream finalised, so the
//! same eligibility path covers both modes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use crate::engine::{Step, StepResult, WorkflowContext};
use crate::repo::VectorStore;
use crate::types::Capability;

/// First-person markers that suggest a durable personal fact. A real
/// deployment swaps this for a model-backed classifier; the trigger
/// surface stays the same.
const FACT_MARKERS: &[&str] = &[
    "my name is",
    "i live in",
    "i work",
    "i am allergic",
    "i prefer",
    "call me",
    "my birthday",
    "i use",
];

pub fn looks_like_durable_fact(text: &str) -> bool {
    let lower = text.to_lowercase();
    FACT_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub struct MemoryWriteStep {
    vector: Arc<dyn VectorStore>,
}

impl MemoryWriteStep {
    pub fn new(vector: Arc<dyn VectorStore>) -> Self {
        Self { vector }
    }
}

#[async_trait]
impl Step for MemoryWriteStep {
    fn name(&self) -> &'static str {
        "memory_write"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["response_transform"]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        if ctx.capability != Capability::Chat {
            return StepResult::skipped("non_chat");
        }
        if !ctx.is_external() {
            return StepResult::skipped("internal_channel");
        }
        if !ctx.success {
            return StepResult::skipped("request_failed");
        }
        let Some(user_id) = ctx.user_id.clone() else {
            return StepResult::skipped("no_user");
        };
        let Some(text) = ctx
            .get("validation", "validated")
            .and_then(|v| v.get("messages"))
            .and_then(Value::as_array)
            .and_then(|msgs| {
                msgs.iter()
                    .rev()
                    .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            })
            .and_then(|m| m.get("content").and_then(Value::as_str))
            .map(str::to_string)
        else {
            return StepResult::skipped("no_text");
        };

        let vector = self.vector.clone();
        let trace_id = ctx.trace_id.clone();
        // Scheduled, not awaited: memory extraction never adds latency to
        // the response path.
        tokio::spawn(async move {
            if !looks_like_durable_fact(&text) {
                return;
            }
            let metadata = json!({"source": "external_chat", "trace_id": trace_id});
            if let Err(e) = vector.upsert_memory(&user_id, &text, metadata).await {
                warn!(trace_id, error = %e, "memory persistence failed");
            }
        });

        StepResult::success_with(json!({"scheduled": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStatus;
    use crate::repo::MemoryVectorStore;
    use crate::types::Channel;

    fn ctx_with_message(text: &str) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat).with_user("u-1");
        ctx.set(
            "validation",
            "validated",
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": text}]}),
        );
        ctx
    }

    #[test]
    fn classifier_detects_first_person_facts() {
        assert!(looks_like_durable_fact("My name is Ada and I live in Berlin"));
        assert!(looks_like_durable_fact("i prefer dark roast coffee"));
        assert!(!looks_like_durable_fact("what is the capital of France?"));
    }

    #[tokio::test]
    async fn durable_fact_is_upserted_in_background() {
        let store = Arc::new(MemoryVectorStore::new());
        let step = MemoryWriteStep::new(store.clone());
        let mut ctx = ctx_with_message("My name is Ada");

        let result = step.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);

        // Give the background task a beat to land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let memories = store.memories_for("u-1");
        assert_eq!(memories.len(), 1);
        assert!(memories[0].contains("Ada"));
    }

    #[tokio::test]
    async fn non_fact_messages_store_nothing() {
        let store = Arc::new(MemoryVectorStore::new());
        let step = MemoryWriteStep::new(store.clone());
        let mut ctx = ctx_with_message("what is 2+2?");
        step.execute(&mut ctx).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(store.memories_for("u-1").is_empty());
    }

    #[tokio::test]
    async fn internal_channel_is_skipped() {
        let store = Arc::new(MemoryVectorStore::new());
        let step = MemoryWriteStep::new(store);
        let mut ctx = WorkflowContext::new(Channel::Internal, Capability::Chat);
        assert_eq!(step.execute(&mut ctx).await.status, StepStatus::Skipped);
    }
}
