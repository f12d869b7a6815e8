//! Anthropic Messages dialect.
//!
//! Inbound: `/v1/messages` requests fold into the canonical shape — the
//! `system` prompt becomes the first system message and content block lists
//! concatenate on their text parts. Outbound: canonical requests become a
//! Messages body with the system messages split back out, and responses
//! normalise to the canonical OpenAI shape.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::GatewayResult;
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, Role, StreamDelta, ToolCall,
    Usage,
};

use super::{map_finish_reason, parse_error};

const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Deserialize)]
struct MessagesRequest {
    model: String,
    #[serde(default)]
    system: Option<Value>,
    #[serde(default)]
    messages: Vec<InboundMessage>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct InboundMessage {
    role: String,
    content: Value,
}

fn block_list_text(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter_map(|block| {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                block.get("text").and_then(Value::as_str).map(str::to_string)
            } else {
                block.as_str().map(str::to_string)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn value_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => block_list_text(blocks),
        other => other.to_string(),
    }
}

/// Fold an Anthropic `/v1/messages` request into the canonical shape.
pub fn adapt_messages(raw: &Value) -> GatewayResult<ChatRequest> {
    let parsed: MessagesRequest =
        serde_json::from_value(raw.clone()).map_err(|e| parse_error("invalid messages request", e))?;

    let mut messages = Vec::with_capacity(parsed.messages.len() + 1);
    if let Some(system) = &parsed.system {
        let text = value_text(system);
        if !text.is_empty() {
            messages.push(ChatMessage::system(text));
        }
    }
    for m in &parsed.messages {
        let role = match m.role.as_str() {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        };
        messages.push(ChatMessage::new(role, value_text(&m.content)));
    }

    Ok(ChatRequest {
        model: parsed.model,
        messages,
        stream: parsed.stream,
        temperature: parsed.temperature,
        max_tokens: parsed.max_tokens,
        top_p: parsed.top_p,
        stop: parsed.stop_sequences,
        ..Default::default()
    })
}

/// Canonical request → Anthropic Messages body. Leading system messages
/// collapse into the `system` field; `max_tokens` is mandatory upstream so
/// a default is applied when the client sent none.
pub fn build_messages_body(req: &ChatRequest) -> GatewayResult<Value> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for m in &req.messages {
        match m.role {
            Role::System => system_parts.push(m.content.as_text()),
            Role::Tool => {
                // Tool results ride as user-side tool_result blocks.
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                        "content": m.content.as_text(),
                    }],
                }));
            }
            Role::User | Role::Assistant => {
                let role = if m.role == Role::Assistant { "assistant" } else { "user" };
                if let Some(tool_calls) = &m.tool_calls {
                    let mut blocks = Vec::new();
                    let text = m.content.as_text();
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    for call in tool_calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::Object(Default::default()));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                    messages.push(json!({"role": role, "content": blocks}));
                } else {
                    messages.push(json!({"role": role, "content": m.content.as_text()}));
                }
            }
        }
    }

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n"));
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(tp) = req.top_p {
        body["top_p"] = json!(tp);
    }
    if let Some(stops) = &req.stop {
        body["stop_sequences"] = json!(stops);
    }
    if req.stream {
        body["stream"] = json!(true);
    }
    Ok(body)
}

/// Anthropic response → canonical. Text blocks concatenate into
/// `choices[0].message.content`; `tool_use` blocks become `tool_calls`.
pub fn normalize_response(raw: &Value) -> GatewayResult<ChatResponse> {
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("msg")
        .to_string();
    let model = raw
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let content_blocks = raw
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| parse_error("invalid anthropic response", "missing content array"))?;

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in content_blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text_parts.push(t.to_string());
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    kind: "function".into(),
                    function: FunctionCall {
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block
                            .get("input")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "{}".into()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = raw
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(map_finish_reason);

    let usage = raw.get("usage").map(|u| {
        let prompt = u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let completion = u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
        let mut usage = Usage::new(prompt, completion);
        usage.cache_read_tokens = u.get("cache_read_input_tokens").and_then(Value::as_u64);
        usage
    });

    let mut message = ChatMessage::assistant(text_parts.join(""));
    if !tool_calls.is_empty() {
        message.tool_calls = Some(tool_calls);
    }

    Ok(ChatResponse {
        id,
        object: "chat.completion".into(),
        created: chrono::Utc::now().timestamp(),
        model,
        choices: vec![Choice { index: 0, message, finish_reason }],
        usage,
    })
}

/// Extract delta fields from one Anthropic SSE frame.
pub fn extract_delta(frame: &Value) -> StreamDelta {
    let mut delta = StreamDelta::default();
    match frame.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            if let Some(prompt) = frame
                .pointer("/message/usage/input_tokens")
                .and_then(Value::as_u64)
            {
                delta.usage = Some(Usage { prompt_tokens: prompt, ..Default::default() });
            }
        }
        Some("content_block_start") => {
            if let Some(block) = frame.get("content_block") {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    delta.tool_calls = Some(vec![ToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        kind: "function".into(),
                        function: FunctionCall {
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: String::new(),
                        },
                    }]);
                }
            }
        }
        Some("content_block_delta") => {
            match frame.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => {
                    delta.content = frame
                        .pointer("/delta/text")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                Some("thinking_delta") => {
                    delta.reasoning = frame
                        .pointer("/delta/thinking")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                Some("input_json_delta") => {
                    delta.tool_calls = frame
                        .pointer("/delta/partial_json")
                        .and_then(Value::as_str)
                        .map(|partial| {
                            vec![ToolCall {
                                id: String::new(),
                                kind: "function".into(),
                                function: FunctionCall {
                                    name: String::new(),
                                    arguments: partial.to_string(),
                                },
                            }]
                        });
                }
                _ => {}
            }
        }
        Some("message_delta") => {
            delta.finish_reason = frame
                .pointer("/delta/stop_reason")
                .and_then(Value::as_str)
                .map(map_finish_reason);
            if let Some(output) = frame.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                delta.usage = Some(Usage {
                    completion_tokens: output,
                    total_tokens: output,
                    ..Default::default()
                });
            }
        }
        _ => {}
    }
    delta
}
