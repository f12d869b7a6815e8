//! Streaming upstream support.
//!
//! Forwards SSE bytes to the client as they arrive while a token
//! accumulator tallies deltas, tool calls and usage for billing. Once the
//! first frame has been sent the request is past the point of no return: a
//! broken upstream stream terminates the client stream with an error frame
//! and the accumulated portion is billed.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::error::GatewayError;
use crate::protocol;
use crate::types::{FinishReason, ProtocolKind, StreamDelta, ToolCall, TransformRules, Usage};
use crate::utils::{CancelHandle, estimate_tokens};

/// Frames delivered to the downstream client.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// One OpenAI-style chunk.
    Chunk(Value),
    /// Clean end of stream.
    Done,
    /// Terminal error; no frames follow.
    Error {
        code: String,
        message: String,
        retry_after: Option<u64>,
    },
}

/// Running totals while a stream is in flight.
#[derive(Debug, Default)]
pub struct TokenAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    frames: u64,
    delta_tokens: u64,
}

impl TokenAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, delta: &StreamDelta) {
        if let Some(content) = &delta.content {
            self.delta_tokens += estimate_tokens(content).max(1);
            self.content.push_str(content);
        }
        if let Some(reasoning) = &delta.reasoning {
            self.reasoning.push_str(reasoning);
        }
        if let Some(calls) = &delta.tool_calls {
            self.tool_calls.extend(calls.iter().cloned());
        }
        if let Some(usage) = &delta.usage {
            let merged = match self.usage {
                Some(existing) => Usage {
                    prompt_tokens: usage.prompt_tokens.max(existing.prompt_tokens),
                    completion_tokens: usage.completion_tokens.max(existing.completion_tokens),
                    total_tokens: usage.total_tokens.max(existing.total_tokens),
                    cache_read_tokens: usage.cache_read_tokens.or(existing.cache_read_tokens),
                },
                None => *usage,
            };
            self.usage = Some(merged);
        }
        if let Some(finish) = &delta.finish_reason {
            self.finish_reason = Some(finish.clone());
        }
    }

    pub fn saw_frame(&mut self) {
        self.frames += 1;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Close the books. Upstream `usage` wins when present; otherwise the
    /// accumulated estimate fills in, with `prompt_estimate` for the input
    /// side.
    pub fn finalize(self, prompt_estimate: u64) -> StreamTotals {
        let usage = match self.usage {
            Some(u) if u.completion_tokens > 0 || u.prompt_tokens > 0 => {
                let prompt = if u.prompt_tokens > 0 { u.prompt_tokens } else { prompt_estimate };
                let completion = if u.completion_tokens > 0 {
                    u.completion_tokens
                } else {
                    self.delta_tokens
                };
                Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                    cache_read_tokens: u.cache_read_tokens,
                }
            }
            _ => Usage::new(prompt_estimate, self.delta_tokens),
        };
        StreamTotals {
            usage,
            content: self.content,
            reasoning: self.reasoning,
            tool_calls: self.tool_calls,
            finish_reason: self.finish_reason,
            frames: self.frames,
        }
    }
}

/// Final accounting of one stream.
#[derive(Debug, Clone)]
pub struct StreamTotals {
    pub usage: Usage,
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub frames: u64,
}

/// Outcome of pumping one upstream stream to the client.
pub struct StreamOutcome {
    pub totals: StreamTotals,
    /// Set when the stream ended abnormally; the client already received a
    /// terminating error frame.
    pub error: Option<GatewayError>,
}

/// Copy the upstream SSE stream to `sender`, accumulating tokens.
///
/// Backpressure is pull-driven: the loop only reads the next upstream frame
/// after the previous one was handed to the channel. The idle timeout
/// resets on every frame.
#[allow(clippy::too_many_arguments)]
pub async fn pump_sse(
    response: reqwest::Response,
    protocol: &ProtocolKind,
    rules: &TransformRules,
    sender: Option<&UnboundedSender<StreamFrame>>,
    cancel: &CancelHandle,
    idle_timeout: std::time::Duration,
    trace_id: &str,
    model: &str,
    prompt_estimate: u64,
) -> StreamOutcome {
    use eventsource_stream::Eventsource;

    let mut acc = TokenAccumulator::new();
    let created = chrono::Utc::now().timestamp();
    let mut stream = response.bytes_stream().eventsource();
    // A stream that ends without a terminator ([DONE], a finish reason, or
    // an explicit stop event) was cut mid-flight.
    let mut terminated = false;

    let error = loop {
        if cancel.is_cancelled() {
            debug!(trace_id, "client cancelled, closing upstream stream");
            break Some(GatewayError::Cancelled);
        }

        let next = tokio::time::timeout(idle_timeout, stream.next()).await;
        let event = match next {
            Err(_) => {
                break Some(if acc.frames() > 0 {
                    GatewayError::UpstreamStreamBroken { frames: acc.frames() }
                } else {
                    GatewayError::UpstreamTimeout { elapsed_ms: idle_timeout.as_millis() as u64 }
                });
            }
            Ok(None) => {
                if !terminated && acc.frames() > 0 {
                    break Some(GatewayError::UpstreamStreamBroken { frames: acc.frames() });
                }
                break None;
            }
            Ok(Some(Err(e))) => {
                break Some(if acc.frames() > 0 {
                    GatewayError::UpstreamStreamBroken { frames: acc.frames() }
                } else {
                    GatewayError::Http(format!("stream error: {e}"))
                });
            }
            Ok(Some(Ok(event))) => event,
        };

        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            terminated = true;
            break None;
        }

        let frame: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(trace_id, error = %e, "skipping unparseable stream frame");
                continue;
            }
        };
        let delta = match protocol::extract_delta(protocol, &frame, rules) {
            Ok(d) => d,
            Err(_) => StreamDelta::default(),
        };
        if delta.finish_reason.is_some()
            || frame.get("type").and_then(Value::as_str) == Some("message_stop")
        {
            terminated = true;
        }

        acc.saw_frame();
        acc.absorb(&delta);

        if let Some(tx) = sender {
            if !delta.is_empty() {
                let chunk = protocol::delta_to_chunk(&delta, trace_id, model, created);
                if tx.send(StreamFrame::Chunk(chunk)).is_err() {
                    // Client went away; treat as cancellation.
                    break Some(GatewayError::Cancelled);
                }
            }
        }
    };

    if let Some(tx) = sender {
        match &error {
            None => {
                let _ = tx.send(StreamFrame::Done);
            }
            Some(err) => {
                let _ = tx.send(StreamFrame::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                    retry_after: err.retry_after(),
                });
            }
        }
    }

    StreamOutcome { totals: acc.finalize(prompt_estimate), error }
}
