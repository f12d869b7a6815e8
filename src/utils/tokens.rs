//! Token estimation used when upstreams omit usage.

use crate::types::{ChatMessage, MessageContent};

/// Rough token estimate: one token per four characters, minimum one for
/// non-empty text. Good enough for billing fallbacks and TPM sizing; exact
/// counts come from upstream `usage` whenever present.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() as u64) / 4).max(1)
}

/// Estimate prompt tokens across a message list, including a small per
/// message framing overhead.
pub fn estimate_message_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| {
            let body = match &m.content {
                MessageContent::Text(t) => estimate_tokens(t),
                MessageContent::Parts(_) => estimate_tokens(&m.content.as_text()),
            };
            body + 4
        })
        .sum()
}
