//! Orchestration engine: topological execution of a workflow DAG over a
//! shared context.
//!
//! Single-threaded per request: one step at a time, each awaited to
//! completion. Steps at equal depth run sequentially in template order so
//! context mutation stays race-free by construction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::StepState;

use super::context::WorkflowContext;
use super::registry::StepHandle;
use super::step::{FailureAction, StepResult, StepStatus};

/// Raised when the declared dependencies contain a cycle.
#[derive(Debug)]
pub struct CyclicDependencyError {
    pub steps: Vec<String>,
}

impl std::fmt::Display for CyclicDependencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cyclic dependency between steps: {}", self.steps.join(", "))
    }
}

impl std::error::Error for CyclicDependencyError {}

/// Outcome of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub steps_run: usize,
}

pub struct OrchestrationEngine {
    default_timeout: Duration,
    default_max_retries: u32,
}

impl OrchestrationEngine {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            default_timeout: config.step_timeout,
            default_max_retries: config.step_max_retries,
        }
    }

    /// Topologically order `steps`, preserving template order among ready
    /// steps. Dependencies naming steps absent from the list are ignored.
    pub fn plan(steps: &[StepHandle]) -> Result<Vec<usize>, CyclicDependencyError> {
        let name_to_idx: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, h)| (h.step.name(), i))
            .collect();

        let deps: Vec<Vec<usize>> = steps
            .iter()
            .map(|h| {
                h.step
                    .depends_on()
                    .iter()
                    .filter_map(|d| name_to_idx.get(d).copied())
                    .collect()
            })
            .collect();

        let mut order = Vec::with_capacity(steps.len());
        let mut placed = vec![false; steps.len()];
        while order.len() < steps.len() {
            let mut advanced = false;
            for i in 0..steps.len() {
                if placed[i] {
                    continue;
                }
                if deps[i].iter().all(|&d| placed[d]) {
                    placed[i] = true;
                    order.push(i);
                    advanced = true;
                }
            }
            if !advanced {
                let stuck = steps
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed[*i])
                    .map(|(_, h)| h.step.name().to_string())
                    .collect();
                return Err(CyclicDependencyError { steps: stuck });
            }
        }
        Ok(order)
    }

    /// Execute the workflow. Returns `success=false` when any aborting step
    /// failed; independent tail steps still ran.
    pub async fn execute(
        &self,
        steps: &[StepHandle],
        ctx: &mut WorkflowContext,
    ) -> Result<ExecutionResult, CyclicDependencyError> {
        let order = Self::plan(steps)?;

        // Status of every step by name; dependents consult this map.
        let mut statuses: HashMap<&str, StepStatus> = HashMap::new();
        let mut cancelled_tail = false;
        let mut steps_run = 0usize;

        for idx in order {
            let handle = &steps[idx];
            let name = handle.step.name();

            let blocked = handle
                .step
                .depends_on()
                .iter()
                .filter_map(|d| statuses.get(d))
                .any(|s| *s == StepStatus::Failed);

            if blocked || (cancelled_tail && !handle.step.depends_on().is_empty()) {
                debug!(step = name, "skipping dependent of failed step");
                ctx.record_step(name, StepStatus::Skipped.as_str(), 0);
                statuses.insert(name, StepStatus::Failed); // block transitive dependents
                continue;
            }

            if ctx.cancel.is_cancelled() && !cancelled_tail {
                ctx.mark_error(&GatewayError::Cancelled);
                cancelled_tail = true;
                // Steps with dependencies are skipped from here on;
                // independent tails (audit) still run.
                if !handle.step.depends_on().is_empty() {
                    ctx.record_step(name, StepStatus::Skipped.as_str(), 0);
                    statuses.insert(name, StepStatus::Failed);
                    continue;
                }
            }

            let result = self.run_with_policy(handle, ctx).await;
            steps_run += 1;
            statuses.insert(name, result.status);

            if result.status == StepStatus::Failed {
                if ctx.error_code.is_none() {
                    let message = result
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("step {name} failed"));
                    ctx.mark_error(&GatewayError::Internal(message));
                }
                ctx.success = false;
            }
        }

        Ok(ExecutionResult { success: ctx.success, steps_run })
    }

    async fn run_with_policy(&self, handle: &StepHandle, ctx: &mut WorkflowContext) -> StepResult {
        let name = handle.step.name();
        let timeout = handle.config.timeout.unwrap_or(self.default_timeout);
        let max_retries = handle.config.max_retries.unwrap_or(self.default_max_retries);

        let mut attempt = 1u32;
        loop {
            ctx.emit_status(name, StepState::Running, None);
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, handle.step.execute(ctx)).await {
                Ok(r) => r,
                Err(_) => StepResult::fail_with(
                    ctx,
                    GatewayError::StepTimeout { step: name.to_string() },
                ),
            };
            let elapsed = started.elapsed().as_millis() as u64;

            match result.status {
                StepStatus::Success | StepStatus::Skipped => {
                    ctx.record_step(name, result.status.as_str(), elapsed);
                    ctx.emit_status(name, StepState::Success, None);
                    return result;
                }
                StepStatus::Failed => {
                    ctx.record_step(name, result.status.as_str(), elapsed);
                    let action = handle.step.on_failure(ctx, attempt);
                    match action {
                        FailureAction::Retry if attempt <= max_retries => {
                            let backoff = Duration::from_millis(100 * (1 << attempt.min(6)));
                            warn!(step = name, attempt, "retrying step after failure");
                            tokio::time::sleep(backoff).await;
                            attempt += 1;
                            continue;
                        }
                        FailureAction::Skip => {
                            debug!(step = name, "failure downgraded to skip");
                            ctx.emit_status(name, StepState::Success, None);
                            return StepResult::skipped(
                                result.message.unwrap_or_else(|| "failure skipped".into()),
                            );
                        }
                        _ => {
                            ctx.emit_status(
                                name,
                                StepState::Failed,
                                ctx.error_code.as_deref(),
                            );
                            return result;
                        }
                    }
                }
            }
        }
    }
}
