//! Gemini generateContent dialect.

use serde_json::{Value, json};

use crate::error::GatewayResult;
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, Role, StreamDelta, ToolCall,
    Usage,
};

use super::{map_finish_reason, parse_error};

/// Canonical request → `generateContent` body. System messages move into
/// `systemInstruction`; assistant turns use the `model` role.
pub fn build_generate_body(req: &ChatRequest) -> GatewayResult<Value> {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for m in &req.messages {
        match m.role {
            Role::System => system_parts.push(json!({"text": m.content.as_text()})),
            Role::Tool => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": m.name.clone().unwrap_or_default(),
                            "response": {"content": m.content.as_text()},
                        }
                    }],
                }));
            }
            Role::User | Role::Assistant => {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                let mut parts = Vec::new();
                let text = m.content.as_text();
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                if let Some(calls) = &m.tool_calls {
                    for call in calls {
                        let args: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::Object(Default::default()));
                        parts.push(json!({
                            "functionCall": {"name": call.function.name, "args": args}
                        }));
                    }
                }
                if parts.is_empty() {
                    parts.push(json!({"text": ""}));
                }
                contents.push(json!({"role": role, "parts": parts}));
            }
        }
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(t) = req.temperature {
        generation_config.insert("temperature".into(), json!(t));
    }
    if let Some(tp) = req.top_p {
        generation_config.insert("topP".into(), json!(tp));
    }
    if let Some(max) = req.max_tokens {
        generation_config.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(stops) = &req.stop {
        generation_config.insert("stopSequences".into(), json!(stops));
    }

    let mut body = json!({"contents": contents});
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({"parts": system_parts});
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }
    Ok(body)
}

fn parts_to_message(parts: &[Value]) -> (String, Vec<ToolCall>) {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text_parts.push(t.to_string());
        }
        if let Some(call) = part.get("functionCall") {
            tool_calls.push(ToolCall {
                id: format!("call_{i}"),
                kind: "function".into(),
                function: FunctionCall {
                    name: call
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call
                        .get("args")
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "{}".into()),
                },
            });
        }
    }
    (text_parts.concat(), tool_calls)
}

fn usage_from_metadata(raw: &Value) -> Option<Usage> {
    raw.get("usageMetadata").map(|u| {
        let prompt = u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0);
        let completion = u
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let total = u
            .get("totalTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(prompt + completion);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            cache_read_tokens: u.get("cachedContentTokenCount").and_then(Value::as_u64),
        }
    })
}

/// Gemini response → canonical. Part texts concatenate; `functionCall`
/// parts become `tool_calls`; `usageMetadata` fields rename to the
/// canonical `prompt_tokens`/`completion_tokens`.
pub fn normalize_response(raw: &Value) -> GatewayResult<ChatResponse> {
    let candidates = raw
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| parse_error("invalid gemini response", "missing candidates"))?;

    let mut choices = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let (text, tool_calls) = parts_to_message(&parts);
        let mut message = ChatMessage::assistant(text);
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls);
        }
        choices.push(Choice {
            index: index as u32,
            message,
            finish_reason: candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .map(map_finish_reason),
        });
    }

    Ok(ChatResponse {
        id: raw
            .get("responseId")
            .and_then(Value::as_str)
            .unwrap_or("gemini")
            .to_string(),
        object: "chat.completion".into(),
        created: chrono::Utc::now().timestamp(),
        model: raw
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        choices,
        usage: usage_from_metadata(raw),
    })
}

/// Extract the delta fields of one `streamGenerateContent` frame.
pub fn extract_delta(frame: &Value) -> StreamDelta {
    let mut delta = StreamDelta::default();
    if let Some(parts) = frame
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    {
        let (text, tool_calls) = parts_to_message(parts);
        if !text.is_empty() {
            delta.content = Some(text);
        }
        if !tool_calls.is_empty() {
            delta.tool_calls = Some(tool_calls);
        }
    }
    delta.finish_reason = frame
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .map(map_finish_reason);
    delta.usage = usage_from_metadata(frame);
    delta
}
