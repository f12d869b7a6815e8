//! Conversation-prefix affinity.
//!
//! A conversation that recently succeeded against an arm keeps preferring
//! it: the leading share of the message list hashes to a KV record mapping
//! prefix → arm id, and the selector grants that arm a score bonus while
//! the record lives.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::cache::{CacheKeys, KvStore};
use crate::error::GatewayResult;
use crate::types::ChatMessage;

/// Hash the leading `ratio` share of the message list (at least one
/// message) into a stable prefix key.
pub fn prefix_hash(messages: &[ChatMessage], ratio: f64) -> Option<String> {
    if messages.is_empty() {
        return None;
    }
    let take = ((messages.len() as f64 * ratio).ceil() as usize)
        .clamp(1, messages.len());
    let mut hasher = Sha256::new();
    for m in &messages[..take] {
        hasher.update(m.role.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(m.content.as_text().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    Some(digest[..16].to_string())
}

pub struct AffinityTracker {
    kv: Arc<dyn KvStore>,
    ratio: f64,
    ttl: Duration,
}

impl AffinityTracker {
    pub fn new(kv: Arc<dyn KvStore>, ratio: f64, ttl: Duration) -> Self {
        Self { kv, ratio, ttl }
    }

    /// Arm id recorded for this conversation prefix, if any.
    pub async fn lookup(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> GatewayResult<Option<String>> {
        let Some(hash) = prefix_hash(messages, self.ratio) else {
            return Ok(None);
        };
        self.kv.get(&CacheKeys::affinity(model, &hash)).await
    }

    /// Record a successful arm for this prefix.
    pub async fn record(
        &self,
        model: &str,
        messages: &[ChatMessage],
        arm_id: &str,
    ) -> GatewayResult<()> {
        let Some(hash) = prefix_hash(messages, self.ratio) else {
            return Ok(());
        };
        // Jitter keeps a burst of same-conversation records from expiring
        // in one stampede.
        let ttl = crate::cache::jittered_ttl(self.ttl, 0.1);
        self.kv
            .set(&CacheKeys::affinity(model, &hash), arm_id, Some(ttl))
            .await
    }
}
