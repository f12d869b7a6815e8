//! Step contract: named unit with declared dependencies, an execute
//! function and a failure policy.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;

use super::context::WorkflowContext;

/// Outcome status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// What a step hands back to the engine.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub status: StepStatus,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl StepResult {
    pub fn success() -> Self {
        Self { status: StepStatus::Success, message: None, data: None }
    }

    pub fn success_with(data: Value) -> Self {
        Self { status: StepStatus::Success, message: None, data: Some(data) }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self { status: StepStatus::Skipped, message: Some(message.into()), data: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { status: StepStatus::Failed, message: Some(message.into()), data: None }
    }

    /// Mark the context with `err` and fail the step in one move.
    pub fn fail_with(ctx: &mut WorkflowContext, err: GatewayError) -> Self {
        ctx.mark_error(&err);
        Self::failed(err.to_string())
    }
}

/// Failure policy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Run the step again (the engine applies backoff and its retry cap).
    Retry,
    /// Fail the workflow; transitive dependents are skipped.
    Abort,
    /// Swallow the failure and let dependents proceed.
    Skip,
}

/// Per-step overrides coming from the workflow template.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub weight: Option<u32>,
}

/// A named pipeline step.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    /// Names of steps that must succeed before this one runs. Names absent
    /// from the active workflow are ignored, so one step definition serves
    /// every channel's template.
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> StepResult;

    /// Consulted after a failed attempt; `attempt` starts at 1.
    fn on_failure(&self, _ctx: &WorkflowContext, _attempt: u32) -> FailureAction {
        FailureAction::Abort
    }
}
