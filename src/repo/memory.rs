//! In-memory repository implementations.
//!
//! Dashmap-backed; used by tests and embedded single-node deployments.
//! Mutating operations take per-entity locks so turn-index reservation and
//! bandit CAS behave like their transactional database counterparts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{GatewayError, GatewayResult, QuotaKind};
use crate::types::{
    AuditRecord, BanditArmState, Capability, Channel, ConversationMessage, ConversationSession,
    QuotaRecord, UpstreamCandidate,
};

use super::{
    ApiKeyRecord, ApiKeyRepository, AuditSink, BanditRepository, ConversationRepository,
    QuotaRepository, UpstreamCatalog, VectorStore,
};

#[derive(Default)]
pub struct MemoryApiKeys {
    by_hash: DashMap<String, ApiKeyRecord>,
}

impl MemoryApiKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ApiKeyRecord) {
        self.by_hash.insert(record.key_hash.clone(), record);
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryApiKeys {
    async fn find_by_key_hash(&self, key_hash: &str) -> GatewayResult<Option<ApiKeyRecord>> {
        Ok(self.by_hash.get(key_hash).map(|r| r.clone()))
    }
}

/// Candidate catalog keyed by requested model name.
#[derive(Default)]
pub struct MemoryCatalog {
    by_model: DashMap<String, Vec<UpstreamCandidate>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, model: &str, candidate: UpstreamCandidate) {
        self.by_model
            .entry(model.to_string())
            .or_default()
            .push(candidate);
    }
}

#[async_trait]
impl UpstreamCatalog for MemoryCatalog {
    async fn candidates_for_model(
        &self,
        model: &str,
        _capability: Capability,
        _channel: Channel,
        _user_id: Option<&str>,
    ) -> GatewayResult<Vec<UpstreamCandidate>> {
        Ok(self
            .by_model
            .get(model)
            .map(|v| v.clone())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryBanditArms {
    arms: DashMap<String, BanditArmState>,
}

impl MemoryBanditArms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, state: BanditArmState) {
        self.arms.insert(state.arm_id.clone(), state);
    }
}

#[async_trait]
impl BanditRepository for MemoryBanditArms {
    async fn get_arm(&self, arm_id: &str) -> GatewayResult<Option<BanditArmState>> {
        Ok(self.arms.get(arm_id).map(|a| a.clone()))
    }

    async fn cas_update(&self, state: &BanditArmState) -> GatewayResult<bool> {
        let mut entry = self
            .arms
            .entry(state.arm_id.clone())
            .or_insert_with(|| BanditArmState::fresh(&state.arm_id));
        // Writers carry the version they observed; a store ahead of that
        // means a concurrent update won.
        if entry.version != state.version {
            return Ok(false);
        }
        let mut next = state.clone();
        next.version += 1;
        *entry = next;
        Ok(true)
    }
}

struct SessionSlot {
    session: ConversationSession,
    messages: Vec<ConversationMessage>,
}

#[derive(Default)]
pub struct MemoryConversations {
    sessions: DashMap<String, Arc<Mutex<SessionSlot>>>,
}

impl MemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: &str) -> Option<Arc<Mutex<SessionSlot>>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversations {
    async fn get_session(&self, session_id: &str) -> GatewayResult<Option<ConversationSession>> {
        Ok(self.slot(session_id).map(|s| s.lock().session.clone()))
    }

    async fn upsert_session(&self, session: &ConversationSession) -> GatewayResult<()> {
        match self.slot(&session.id) {
            Some(slot) => slot.lock().session = session.clone(),
            None => {
                self.sessions.insert(
                    session.id.clone(),
                    Arc::new(Mutex::new(SessionSlot {
                        session: session.clone(),
                        messages: Vec::new(),
                    })),
                );
            }
        }
        Ok(())
    }

    async fn max_turn_index(&self, session_id: &str) -> GatewayResult<u64> {
        Ok(self
            .slot(session_id)
            .map(|s| {
                s.lock()
                    .messages
                    .iter()
                    .map(|m| m.turn_index)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0))
    }

    async fn append_messages(
        &self,
        session_id: &str,
        messages: &[ConversationMessage],
    ) -> GatewayResult<()> {
        let slot = self
            .slot(session_id)
            .ok_or_else(|| GatewayError::Repository(format!("unknown session {session_id}")))?;
        let mut guard = slot.lock();
        for msg in messages {
            if guard.messages.iter().any(|m| m.turn_index == msg.turn_index) {
                return Err(GatewayError::Repository(format!(
                    "duplicate turn_index {} in session {session_id}",
                    msg.turn_index
                )));
            }
            guard.messages.push(msg.clone());
        }
        let max_turn = guard
            .messages
            .iter()
            .map(|m| m.turn_index)
            .max()
            .unwrap_or(0);
        guard.session.message_count = max_turn;
        let now = Utc::now();
        guard.session.last_active_at = Some(now);
        if guard.session.first_message_at.is_none() {
            guard.session.first_message_at = Some(now);
        }
        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<ConversationMessage>> {
        let Some(slot) = self.slot(session_id) else {
            return Ok(Vec::new());
        };
        let guard = slot.lock();
        let mut live: Vec<_> = guard.messages.iter().filter(|m| !m.deleted).cloned().collect();
        live.sort_by_key(|m| m.turn_index);
        let skip = live.len().saturating_sub(limit);
        Ok(live.into_iter().skip(skip).collect())
    }
}

#[derive(Default)]
pub struct MemoryQuotas {
    records: DashMap<(String, QuotaKind), QuotaRecord>,
}

impl MemoryQuotas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, record: QuotaRecord) {
        self.records
            .insert((record.api_key_id.clone(), record.kind), record);
    }
}

#[async_trait]
impl QuotaRepository for MemoryQuotas {
    async fn get(&self, api_key_id: &str, kind: QuotaKind) -> GatewayResult<Option<QuotaRecord>> {
        Ok(self
            .records
            .get(&(api_key_id.to_string(), kind))
            .map(|r| r.clone()))
    }

    async fn record_usage(
        &self,
        api_key_id: &str,
        kind: QuotaKind,
        amount: u64,
    ) -> GatewayResult<()> {
        if let Some(mut rec) = self.records.get_mut(&(api_key_id.to_string(), kind)) {
            rec.used = rec.used.saturating_add(amount);
        }
        Ok(())
    }

    async fn refund(&self, api_key_id: &str, kind: QuotaKind, amount: u64) -> GatewayResult<()> {
        if let Some(mut rec) = self.records.get_mut(&(api_key_id.to_string(), kind)) {
            rec.used = rec.used.saturating_sub(amount);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> GatewayResult<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    memories: DashMap<String, Vec<(String, serde_json::Value)>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memories_for(&self, user_id: &str) -> Vec<String> {
        self.memories
            .get(user_id)
            .map(|v| v.iter().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert_memory(
        &self,
        user_id: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> GatewayResult<()> {
        self.memories
            .entry(user_id.to_string())
            .or_default()
            .push((text.to_string(), metadata));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[tokio::test]
    async fn bandit_cas_detects_stale_writer() {
        let arms = MemoryBanditArms::new();
        arms.seed(BanditArmState::fresh("arm-1"));

        let mut a = arms.get_arm("arm-1").await.unwrap().unwrap();
        let b = arms.get_arm("arm-1").await.unwrap().unwrap();

        a.successes += 1;
        assert!(arms.cas_update(&a).await.unwrap());

        // b still carries version 0 and must lose
        assert!(!arms.cas_update(&b).await.unwrap());

        let fresh = arms.get_arm("arm-1").await.unwrap().unwrap();
        assert_eq!(fresh.version, 1);
        assert_eq!(fresh.successes, 1);
    }

    #[tokio::test]
    async fn append_rejects_duplicate_turn_index() {
        let repo = MemoryConversations::new();
        let session = ConversationSession::new("s1", "u1", Channel::Internal);
        repo.upsert_session(&session).await.unwrap();

        let m1 = ConversationMessage::text("s1", 1, Role::User, "hi");
        repo.append_messages("s1", &[m1.clone()]).await.unwrap();
        assert!(repo.append_messages("s1", &[m1]).await.is_err());
    }

    #[tokio::test]
    async fn recent_messages_skips_deleted_and_orders() {
        let repo = MemoryConversations::new();
        repo.upsert_session(&ConversationSession::new("s1", "u1", Channel::Internal))
            .await
            .unwrap();
        let mut m2 = ConversationMessage::text("s1", 2, Role::Assistant, "a");
        m2.deleted = true;
        repo.append_messages(
            "s1",
            &[
                ConversationMessage::text("s1", 1, Role::User, "q"),
                m2,
                ConversationMessage::text("s1", 3, Role::User, "again"),
            ],
        )
        .await
        .unwrap();

        let recent = repo.recent_messages("s1", 10).await.unwrap();
        let turns: Vec<u64> = recent.iter().map(|m| m.turn_index).collect();
        assert_eq!(turns, vec![1, 3]);
    }
}
