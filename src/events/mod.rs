//! Internal event bus: status frames for SSE subscribers and log taps.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Lifecycle state of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Running,
    Success,
    Failed,
}

/// One status-channel frame, shaped for SSE delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFrame {
    pub stage: String,
    pub step: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Fire-and-forget status emitter handed to the workflow context.
#[derive(Clone)]
pub struct StatusEmitter {
    tx: UnboundedSender<StatusFrame>,
}

impl StatusEmitter {
    pub fn channel() -> (Self, UnboundedReceiver<StatusFrame>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    /// Best-effort send; a departed subscriber never fails the pipeline.
    pub fn emit(&self, frame: StatusFrame) {
        let _ = self.tx.send(frame);
    }

    pub fn step(&self, step: &str, state: StepState, code: Option<&str>) {
        self.emit(StatusFrame {
            stage: "workflow".into(),
            step: step.to_string(),
            state,
            code: code.map(str::to_string),
            meta: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (emitter, mut rx) = StatusEmitter::channel();
        emitter.step("validation", StepState::Running, None);
        emitter.step("validation", StepState::Success, None);
        assert_eq!(rx.recv().await.unwrap().state, StepState::Running);
        assert_eq!(rx.recv().await.unwrap().state, StepState::Success);
    }

    #[test]
    fn dropped_receiver_does_not_error() {
        let (emitter, rx) = StatusEmitter::channel();
        drop(rx);
        emitter.step("x", StepState::Failed, Some("INTERNAL"));
    }
}
