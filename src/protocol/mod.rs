//! Wire-format mapping between the canonical chat shape and vendor
//! dialects.
//!
//! Inbound adapters fold OpenAI, Anthropic and Responses requests into
//! [`ChatRequest`]; outbound builders materialise vendor request bodies;
//! normalisers fold vendor responses back into the canonical OpenAI shape.
//! Each dialect lives in its own module; this module only dispatches.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod responses;

use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{
    ChatRequest, ChatResponse, FinishReason, InboundDialect, ProtocolKind, StreamDelta,
    TransformRules,
};

/// Fold an inbound request payload into the canonical shape.
pub fn adapt_inbound(dialect: InboundDialect, raw: &Value) -> GatewayResult<ChatRequest> {
    match dialect {
        InboundDialect::OpenAi => openai::adapt_chat(raw),
        InboundDialect::Anthropic => anthropic::adapt_messages(raw),
        InboundDialect::Responses => responses::adapt_request(raw),
    }
}

/// Build the vendor request body for a canonical request.
///
/// Azure speaks the OpenAI dialect; `custom` upstreams receive the canonical
/// body untouched and rely on templates for any reshaping.
pub fn build_request_body(protocol: &ProtocolKind, req: &ChatRequest) -> GatewayResult<Value> {
    match protocol {
        ProtocolKind::OpenAi | ProtocolKind::Azure | ProtocolKind::Custom => {
            openai::build_chat_body(req)
        }
        ProtocolKind::Anthropic => anthropic::build_messages_body(req),
        ProtocolKind::Gemini | ProtocolKind::Google => gemini::build_generate_body(req),
    }
}

/// Normalise a vendor response into the canonical OpenAI-shaped payload.
pub fn normalize_response(protocol: &ProtocolKind, raw: &Value) -> GatewayResult<ChatResponse> {
    match protocol {
        ProtocolKind::OpenAi | ProtocolKind::Azure | ProtocolKind::Custom => {
            openai::normalize_response(raw)
        }
        ProtocolKind::Anthropic => anthropic::normalize_response(raw),
        ProtocolKind::Gemini | ProtocolKind::Google => gemini::normalize_response(raw),
    }
}

/// Extract the incremental fields of one vendor stream frame.
pub fn extract_delta(
    protocol: &ProtocolKind,
    frame: &Value,
    rules: &TransformRules,
) -> GatewayResult<StreamDelta> {
    match protocol {
        ProtocolKind::OpenAi | ProtocolKind::Azure | ProtocolKind::Custom => {
            Ok(openai::extract_delta(frame, rules))
        }
        ProtocolKind::Anthropic => Ok(anthropic::extract_delta(frame)),
        ProtocolKind::Gemini | ProtocolKind::Google => Ok(gemini::extract_delta(frame)),
    }
}

/// Render a delta as an OpenAI-style stream chunk for the client.
pub fn delta_to_chunk(delta: &StreamDelta, trace_id: &str, model: &str, created: i64) -> Value {
    let mut d = serde_json::Map::new();
    if let Some(content) = &delta.content {
        d.insert("content".into(), Value::String(content.clone()));
    }
    if let Some(tool_calls) = &delta.tool_calls {
        d.insert(
            "tool_calls".into(),
            serde_json::to_value(tool_calls).unwrap_or(Value::Null),
        );
    }
    serde_json::json!({
        "id": format!("chatcmpl-{trace_id}"),
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": Value::Object(d),
            "finish_reason": delta.finish_reason.as_ref().map(|f| f.as_str()),
        }],
    })
}

/// Fetch a dotted path like `choices.0.delta.content` out of a payload.
pub(crate) fn extract_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = value;
    for seg in path.split('.') {
        cursor = match cursor {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}

/// Map a vendor finish-reason token onto the canonical vocabulary.
pub(crate) fn map_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" | "STOP" | "end_turn" | "stop_sequence" => FinishReason::Stop,
        "length" | "MAX_TOKENS" | "max_tokens" => FinishReason::Length,
        "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
        "content_filter" | "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn parse_error(context: &str, detail: impl std::fmt::Display) -> GatewayError {
    GatewayError::Parse(format!("{context}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_extraction_walks_arrays() {
        let v = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert_eq!(
            extract_by_path(&v, "choices.0.delta.content"),
            Some(&json!("hi"))
        );
        assert_eq!(extract_by_path(&v, "choices.1.delta"), None);
    }

    #[test]
    fn finish_reason_table() {
        assert_eq!(map_finish_reason("end_turn"), FinishReason::Stop);
        assert_eq!(map_finish_reason("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(map_finish_reason("tool_use"), FinishReason::ToolCalls);
        assert_eq!(map_finish_reason("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(
            map_finish_reason("weird"),
            FinishReason::Other("weird".into())
        );
    }

    #[test]
    fn chunk_has_openai_shape() {
        let delta = StreamDelta { content: Some("hey".into()), ..Default::default() };
        let chunk = delta_to_chunk(&delta, "t-1", "gpt-4", 1);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hey");
        assert!(chunk["choices"][0]["finish_reason"].is_null());
    }
}
