//! Conversation Core
//!
//! Turn-index reservation (atomic KV script with repository resync so
//! indexes never regress after cache loss), message persistence, history
//! loading and the idle-summary scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

use crate::cache::scripts::names;
use crate::cache::{CacheKeys, KvStore, ScriptSet};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::repo::ConversationRepository;
use crate::types::{ConversationMessage, ConversationSession};

/// Work item emitted when a session has been idle long enough to summarise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryJob {
    pub session_id: String,
}

pub struct ConversationService {
    repo: Arc<dyn ConversationRepository>,
    kv: Arc<dyn KvStore>,
    scripts: Arc<ScriptSet>,
    meta_ttl: Duration,
}

impl ConversationService {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        kv: Arc<dyn KvStore>,
        scripts: Arc<ScriptSet>,
        config: &GatewayConfig,
    ) -> Self {
        Self { repo, kv, scripts, meta_ttl: config.conversation_meta_ttl }
    }

    /// Reserve `n` consecutive turn indexes for a session.
    ///
    /// The KV counter is the fast path; the repository maximum is passed as
    /// a floor so a lost KV entry can never hand out an index that already
    /// exists.
    pub async fn reserve_turns(&self, session_id: &str, n: u64) -> GatewayResult<u64> {
        if n == 0 {
            return Err(GatewayError::Internal("cannot reserve zero turns".into()));
        }
        let db_floor = self.repo.max_turn_index(session_id).await?;
        let reply = self
            .scripts
            .eval(
                names::TURN_RESERVE,
                &[CacheKeys::conversation_meta(session_id)],
                &[
                    n.to_string(),
                    db_floor.to_string(),
                    self.meta_ttl.as_secs().to_string(),
                ],
            )
            .await?;
        let first = reply
            .first()
            .copied()
            .filter(|v| *v > 0)
            .ok_or_else(|| GatewayError::Kv("turn reservation returned no index".into()))?;
        Ok(first as u64)
    }

    pub async fn get_session(&self, session_id: &str) -> GatewayResult<ConversationSession> {
        self.repo
            .get_session(session_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("session {session_id} not found")))
    }

    pub async fn upsert_session(&self, session: &ConversationSession) -> GatewayResult<()> {
        self.repo.upsert_session(session).await
    }

    /// Persist an exchange (user messages plus the assistant answer) under
    /// freshly reserved turn indexes, in one repository transaction.
    pub async fn append_exchange(
        &self,
        session_id: &str,
        mut messages: Vec<ConversationMessage>,
    ) -> GatewayResult<u64> {
        if messages.is_empty() {
            return Err(GatewayError::Internal("empty exchange".into()));
        }
        let first = self.reserve_turns(session_id, messages.len() as u64).await?;
        for (offset, msg) in messages.iter_mut().enumerate() {
            msg.turn_index = first + offset as u64;
            msg.session_id = session_id.to_string();
        }
        self.repo.append_messages(session_id, &messages).await?;
        debug!(
            session_id,
            first_turn = first,
            count = messages.len(),
            "conversation exchange appended"
        );
        Ok(first)
    }

    pub async fn load_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<ConversationMessage>> {
        self.repo.recent_messages(session_id, limit).await
    }
}

/// Idle-triggered summary scheduling.
///
/// Every new message touches the session: the last-active stamp refreshes
/// and, if no check is pending, a delayed check is armed. The check fires
/// after the idle window and emits a [`SummaryJob`] only when the session
/// stayed quiet the whole time; otherwise the next message re-arms it.
pub struct SummaryScheduler {
    kv: Arc<dyn KvStore>,
    idle: Duration,
    meta_ttl: Duration,
    jobs: UnboundedSender<SummaryJob>,
}

impl SummaryScheduler {
    pub fn new(
        kv: Arc<dyn KvStore>,
        config: &GatewayConfig,
    ) -> (Arc<Self>, UnboundedReceiver<SummaryJob>) {
        let (tx, rx) = unbounded_channel();
        (
            Arc::new(Self {
                kv,
                idle: config.summary_idle,
                meta_ttl: config.conversation_meta_ttl,
                jobs: tx,
            }),
            rx,
        )
    }

    pub async fn touch_session(&self, session_id: &str) {
        if let Err(e) = self.touch_inner(session_id).await {
            warn!(session_id, error = %e, "summary scheduler touch failed");
        }
    }

    async fn touch_inner(&self, session_id: &str) -> GatewayResult<()> {
        let now = Utc::now().timestamp_millis();
        self.kv
            .set(
                &CacheKeys::conversation_summary_last_active(session_id),
                &now.to_string(),
                Some(crate::cache::jittered_ttl(self.meta_ttl, 0.1)),
            )
            .await?;

        let pending_key = CacheKeys::conversation_summary_pending(session_id);
        if !self.kv.set_nx(&pending_key, "1", self.idle).await? {
            return Ok(());
        }

        let kv = self.kv.clone();
        let idle = self.idle;
        let jobs = self.jobs.clone();
        let session = session_id.to_string();
        tokio::spawn(async move {
            Self::idle_check(kv, idle, jobs, &session).await;
        });
        Ok(())
    }

    /// Wait out the idle window, re-arming while messages keep landing, and
    /// emit the job once the session has been quiet for the full window.
    async fn idle_check(
        kv: Arc<dyn KvStore>,
        idle: Duration,
        jobs: UnboundedSender<SummaryJob>,
        session_id: &str,
    ) {
        let pending_key = CacheKeys::conversation_summary_pending(session_id);
        let mut wait = idle;
        // Bounded re-arm so a stuck clock cannot pin the task forever.
        for _ in 0..64 {
            tokio::time::sleep(wait).await;
            let last_active = match kv
                .get(&CacheKeys::conversation_summary_last_active(session_id))
                .await
            {
                Ok(Some(raw)) => raw.parse::<i64>().unwrap_or(0),
                _ => 0,
            };
            let elapsed = Utc::now().timestamp_millis() - last_active;
            if elapsed >= idle.as_millis() as i64 {
                let _ = jobs.send(SummaryJob { session_id: session_id.to_string() });
                let _ = kv.delete(&pending_key).await;
                return;
            }
            wait = idle.saturating_sub(Duration::from_millis(elapsed.max(0) as u64));
            // Keep the pending marker alive while this checker owns the
            // session, so new messages do not double-schedule.
            let _ = kv.set(&pending_key, "1", Some(wait + idle)).await;
        }
        let _ = kv.delete(&pending_key).await;
    }
}
