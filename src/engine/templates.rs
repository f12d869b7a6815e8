//! Static workflow templates: `(channel, capability) → ordered step names`.
//!
//! Templates only name steps; the registry resolves names to concrete
//! types. Steps consult the context themselves to no-op when a template
//! includes them for a capability they do not apply to.

use crate::types::{Capability, Channel};

/// External chat: signed third-party traffic with memory extraction.
pub const EXTERNAL_CHAT: &[&str] = &[
    "request_adapter",
    "validation",
    "signature_verify",
    "quota_check",
    "rate_limit",
    "routing",
    "template_render",
    "upstream_call",
    "response_transform",
    "sanitize",
    "memory_write",
    "billing",
    "audit_log",
];

/// External non-chat capabilities: no adapter, no memory.
pub const EXTERNAL_SIMPLE: &[&str] = &[
    "validation",
    "signature_verify",
    "quota_check",
    "rate_limit",
    "routing",
    "template_render",
    "upstream_call",
    "response_transform",
    "sanitize",
    "billing",
    "audit_log",
];

/// Internal chat: authenticated users with conversation state.
pub const INTERNAL_CHAT: &[&str] = &[
    "request_adapter",
    "validation",
    "quota_check",
    "rate_limit",
    "conversation_load",
    "routing",
    "template_render",
    "upstream_call",
    "response_transform",
    "conversation_append",
    "billing",
    "audit_log",
];

/// Internal non-chat capabilities.
pub const INTERNAL_SIMPLE: &[&str] = &[
    "validation",
    "quota_check",
    "rate_limit",
    "routing",
    "template_render",
    "upstream_call",
    "response_transform",
    "billing",
    "audit_log",
];

/// Resolve the workflow template for a request.
pub fn workflow_for(channel: Channel, capability: Capability) -> &'static [&'static str] {
    match (channel, capability) {
        (Channel::External, Capability::Chat) => EXTERNAL_CHAT,
        (Channel::External, _) => EXTERNAL_SIMPLE,
        (Channel::Internal, Capability::Chat) => INTERNAL_CHAT,
        (Channel::Internal, _) => INTERNAL_SIMPLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_ends_with_audit() {
        for template in [EXTERNAL_CHAT, EXTERNAL_SIMPLE, INTERNAL_CHAT, INTERNAL_SIMPLE] {
            assert_eq!(*template.last().unwrap(), "audit_log");
        }
    }

    #[test]
    fn signature_verification_is_external_only() {
        assert!(EXTERNAL_CHAT.contains(&"signature_verify"));
        assert!(!INTERNAL_CHAT.contains(&"signature_verify"));
        assert!(INTERNAL_CHAT.contains(&"conversation_append"));
        assert!(!EXTERNAL_CHAT.contains(&"conversation_append"));
    }

    #[test]
    fn resolution_matches_channel_and_capability() {
        assert_eq!(
            workflow_for(Channel::External, Capability::Chat).len(),
            EXTERNAL_CHAT.len()
        );
        assert_eq!(
            workflow_for(Channel::Internal, Capability::Image),
            INTERNAL_SIMPLE
        );
    }
}
