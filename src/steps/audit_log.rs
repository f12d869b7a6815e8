//! Final audit step: ship the context's non-sensitive projection to the
//! append-only sink. Independent of every other step so failed requests
//! are audited too.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::engine::{FailureAction, Step, StepResult, WorkflowContext};
use crate::repo::AuditSink;

pub struct AuditLogStep {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogStep {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Step for AuditLogStep {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult {
        let record = ctx.to_audit_record();
        if let Err(e) = self.sink.append(record).await {
            warn!(trace_id = %ctx.trace_id, error = %e, "audit append failed");
            return StepResult::failed("audit sink unavailable");
        }
        StepResult::success()
    }

    fn on_failure(&self, _ctx: &WorkflowContext, _attempt: u32) -> FailureAction {
        // Losing an audit row must not fail an otherwise good response.
        FailureAction::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStatus;
    use crate::repo::MemoryAuditSink;
    use crate::types::{Capability, Channel};

    #[tokio::test]
    async fn appends_projection_with_error_fields() {
        let sink = Arc::new(MemoryAuditSink::new());
        let step = AuditLogStep::new(sink.clone());

        let mut ctx = WorkflowContext::new(Channel::External, Capability::Chat);
        ctx.requested_model = Some("gpt-4".into());
        ctx.mark_error(&crate::error::GatewayError::RateLimited { retry_after: 3 });
        ctx.record_step("rate_limit", "failed", 2);

        let result = step.execute(&mut ctx).await;
        assert_eq!(result.status, StepStatus::Success);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.error_code.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(record.status_code, 429);
        assert!(!record.success);
        assert_eq!(record.steps[0].step, "rate_limit");
    }
}
