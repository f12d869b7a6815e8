//! OpenAI chat dialect: canonical passthrough with tolerant parsing.

use serde_json::Value;

use crate::error::GatewayResult;
use crate::types::{
    ChatRequest, ChatResponse, StreamDelta, ToolCall, TransformRules, Usage,
};

use super::{extract_by_path, map_finish_reason, parse_error};

/// Inbound `/v1/chat/completions` payloads are already canonical.
pub fn adapt_chat(raw: &Value) -> GatewayResult<ChatRequest> {
    serde_json::from_value(raw.clone()).map_err(|e| parse_error("invalid chat request", e))
}

/// Canonical request → OpenAI body. The canonical shape is the OpenAI
/// shape, so this is a serialization with empty optionals dropped.
pub fn build_chat_body(req: &ChatRequest) -> GatewayResult<Value> {
    serde_json::to_value(req).map_err(|e| parse_error("serialize chat request", e))
}

/// Parse an OpenAI-shaped response. Unknown fields are ignored; a missing
/// `usage` block stays `None` for the billing fallback to estimate.
pub fn normalize_response(raw: &Value) -> GatewayResult<ChatResponse> {
    serde_json::from_value(raw.clone()).map_err(|e| parse_error("invalid openai response", e))
}

fn default_rules() -> (&'static str, &'static str, &'static str) {
    (
        "choices.0.delta.content",
        "choices.0.delta.reasoning_content",
        "choices.0.delta.tool_calls",
    )
}

/// Pull the delta fields out of one stream chunk. Paths are configurable
/// per upstream so OpenAI-compatible providers with odd shapes still work.
pub fn extract_delta(frame: &Value, rules: &TransformRules) -> StreamDelta {
    let (content_default, reasoning_default, tools_default) = default_rules();
    let content_path = rules.content_path.as_deref().unwrap_or(content_default);
    let reasoning_path = rules.reasoning_path.as_deref().unwrap_or(reasoning_default);
    let tools_path = rules.tool_calls_path.as_deref().unwrap_or(tools_default);

    let content = extract_by_path(frame, content_path)
        .and_then(Value::as_str)
        .map(str::to_string);
    let reasoning = extract_by_path(frame, reasoning_path)
        .and_then(Value::as_str)
        .map(str::to_string);
    let tool_calls = extract_by_path(frame, tools_path)
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<ToolCall>>(v).ok());
    let finish_reason = extract_by_path(frame, "choices.0.finish_reason")
        .and_then(Value::as_str)
        .map(map_finish_reason);
    let usage = frame
        .get("usage")
        .filter(|u| !u.is_null())
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

    StreamDelta { content, reasoning, tool_calls, finish_reason, usage }
}
