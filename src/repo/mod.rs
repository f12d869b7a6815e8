//! Repository contracts.
//!
//! The core talks to storage through these traits only. Implementations
//! return plain records with all joins done eagerly; nothing here lazily
//! touches a database handle after the call returns. The in-memory
//! implementations in [`memory`] back tests and single-node runs.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayResult, QuotaKind};
use crate::types::{
    AuditRecord, BanditArmState, Capability, Channel, ConversationMessage, ConversationSession,
    QuotaRecord, UpstreamCandidate,
};

pub use memory::{
    MemoryApiKeys, MemoryAuditSink, MemoryBanditArms, MemoryCatalog, MemoryConversations,
    MemoryQuotas, MemoryVectorStore,
};

/// Stored api-key row. Key material is stored hashed; `secret_hash` signs
/// requests, `secret_hint` is the displayable tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub tenant_id: Option<String>,
    pub user_id: String,
    pub key_hash: String,
    pub secret_hash: String,
    pub secret_hint: String,
    pub disabled: bool,
    /// Source IPs that skip signature verification (never quota).
    pub whitelist_ips: Vec<String>,
    /// When non-empty, requests must originate from one of these IPs.
    pub allowed_ips: Vec<String>,
    /// Models this key may request; empty means all.
    pub allowed_models: Vec<String>,
    pub limits: crate::types::LimitConfig,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Look up a key row by the hash of the presented key.
    async fn find_by_key_hash(&self, key_hash: &str) -> GatewayResult<Option<ApiKeyRecord>>;
}

/// The provider catalog: presets, instances, models, credentials joined
/// into ready-made candidates.
#[async_trait]
pub trait UpstreamCatalog: Send + Sync {
    /// All candidates able to serve `model` on `channel`, one per
    /// credential, visibility filtered by `user_id`.
    async fn candidates_for_model(
        &self,
        model: &str,
        capability: Capability,
        channel: Channel,
        user_id: Option<&str>,
    ) -> GatewayResult<Vec<UpstreamCandidate>>;
}

#[async_trait]
pub trait BanditRepository: Send + Sync {
    async fn get_arm(&self, arm_id: &str) -> GatewayResult<Option<BanditArmState>>;

    /// Compare-and-swap on `state.version`. Returns `false` when another
    /// writer advanced the arm first; callers re-read and retry.
    async fn cas_update(&self, state: &BanditArmState) -> GatewayResult<bool>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn get_session(&self, session_id: &str) -> GatewayResult<Option<ConversationSession>>;

    async fn upsert_session(&self, session: &ConversationSession) -> GatewayResult<()>;

    /// Highest live turn index; 0 for an empty session.
    async fn max_turn_index(&self, session_id: &str) -> GatewayResult<u64>;

    /// Persist messages and bump session counters in one transaction.
    async fn append_messages(
        &self,
        session_id: &str,
        messages: &[ConversationMessage],
    ) -> GatewayResult<()>;

    /// Most recent live messages in ascending turn order.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<ConversationMessage>>;
}

#[async_trait]
pub trait QuotaRepository: Send + Sync {
    async fn get(&self, api_key_id: &str, kind: QuotaKind) -> GatewayResult<Option<QuotaRecord>>;

    /// Durable usage write-behind from the billing task.
    async fn record_usage(
        &self,
        api_key_id: &str,
        kind: QuotaKind,
        amount: u64,
    ) -> GatewayResult<()>;

    /// Durable refund matching a failed request.
    async fn refund(&self, api_key_id: &str, kind: QuotaKind, amount: u64) -> GatewayResult<()>;
}

/// Append-only sink for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> GatewayResult<()>;
}

/// Vector-memory capability consumed by the memory-write step.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Store a durable personal fact for a user.
    async fn upsert_memory(
        &self,
        user_id: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> GatewayResult<()>;
}
