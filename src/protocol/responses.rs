//! OpenAI Responses dialect (inbound only).
//!
//! `/v1/responses` requests carry an `input` that is either a string or a
//! list; both become a single user message in the canonical shape.

use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayResult;
use crate::types::{ChatMessage, ChatRequest};

use super::parse_error;

#[derive(Deserialize)]
struct ResponsesRequest {
    model: String,
    input: Value,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_output_tokens: Option<u32>,
}

fn input_text(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Object(obj) => obj
                    .get("content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| item.to_string()),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Fold a Responses request into the canonical shape.
pub fn adapt_request(raw: &Value) -> GatewayResult<ChatRequest> {
    let parsed: ResponsesRequest = serde_json::from_value(raw.clone())
        .map_err(|e| parse_error("invalid responses request", e))?;

    let mut messages = Vec::with_capacity(2);
    if let Some(instructions) = &parsed.instructions {
        if !instructions.is_empty() {
            messages.push(ChatMessage::system(instructions.clone()));
        }
    }
    messages.push(ChatMessage::user(input_text(&parsed.input)));

    Ok(ChatRequest {
        model: parsed.model,
        messages,
        stream: parsed.stream,
        temperature: parsed.temperature,
        max_tokens: parsed.max_output_tokens,
        ..Default::default()
    })
}
