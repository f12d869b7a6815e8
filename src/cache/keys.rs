//! Namespaced cache key builders.
//!
//! Every key in the KV store is produced here; no component formats keys
//! inline. Keeping the full key surface in one place makes rotation and
//! invalidation sweeps reviewable.

/// Builders for every cache key the gateway uses.
pub struct CacheKeys;

impl CacheKeys {
    /// Plaintext upstream credential by provider and reference id.
    pub fn upstream_credential(provider: &str, secret_ref_id: &str) -> String {
        format!("upstream_credential:{provider}:{secret_ref_id}")
    }

    /// Sliding-window request-per-minute bucket for a subject.
    pub fn rate_limit_rpm(subject: &str) -> String {
        format!("rate_limit:{subject}:rpm")
    }

    /// Token-bucket tokens-per-minute state for a subject.
    pub fn rate_limit_tpm(subject: &str) -> String {
        format!("rate_limit:{subject}:tpm")
    }

    /// Circuit-breaker hash for an upstream host.
    pub fn circuit_breaker(host: &str) -> String {
        format!("circuit_breaker:{host}")
    }

    /// Rolling signature-failure counter per api key.
    pub fn signature_fail(api_key_id: &str) -> String {
        format!("signature_fail:{api_key_id}")
    }

    /// Blacklist flag consulted before any signature work.
    pub fn api_key_blacklist(api_key_id: &str) -> String {
        format!("api_key_blacklist:{api_key_id}")
    }

    /// Nonce replay guard within the signature skew window.
    pub fn signature_nonce(api_key_id: &str, nonce: &str) -> String {
        format!("signature_nonce:{api_key_id}:{nonce}")
    }

    /// Pending idle-summary task marker for a session.
    pub fn conversation_summary_pending(session_id: &str) -> String {
        format!("conversation_summary_pending:{session_id}")
    }

    /// Last-active timestamp feeding the idle-summary check.
    pub fn conversation_summary_last_active(session_id: &str) -> String {
        format!("conversation_summary_last_active:{session_id}")
    }

    /// Conversation metadata hash (holds `last_turn`).
    pub fn conversation_meta(session_id: &str) -> String {
        format!("conversation_meta:{session_id}")
    }

    /// Quota counter per api key and quota kind.
    pub fn quota(api_key_id: &str, kind: &str) -> String {
        format!("quota:{api_key_id}:{kind}")
    }

    /// Idempotency marker for quota refunds keyed by trace id.
    pub fn quota_refund_marker(trace_id: &str) -> String {
        format!("quota_refund:{trace_id}")
    }

    /// Idempotency marker for billing records.
    pub fn billing_marker(idempotency_key: &str) -> String {
        format!("billing_record:{idempotency_key}")
    }

    /// Conversation-prefix affinity record for a model.
    pub fn affinity(model: &str, prefix_hash: &str) -> String {
        format!("affinity:{model}:{prefix_hash}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(CacheKeys::rate_limit_rpm("ak-1"), "rate_limit:ak-1:rpm");
        assert_eq!(CacheKeys::circuit_breaker("api.example.com"), "circuit_breaker:api.example.com");
        assert_eq!(
            CacheKeys::upstream_credential("openai", "ref-9"),
            "upstream_credential:openai:ref-9"
        );
    }
}
