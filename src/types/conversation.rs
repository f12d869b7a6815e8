//! Conversation session and message entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::Channel;
use super::chat::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// One conversation owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub channel: Channel,
    pub status: SessionStatus,
    /// Highest turn index handed out; equals the live message count when no
    /// soft deletes have occurred.
    pub message_count: u64,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            assistant_id: None,
            channel,
            status: SessionStatus::Active,
            message_count: 0,
            first_message_at: None,
            last_active_at: None,
        }
    }
}

/// One message within a session. `(session_id, turn_index)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub session_id: String,
    pub turn_index: u64,
    pub role: Role,
    pub content: serde_json::Value,
    pub token_estimate: u64,
    pub truncated: bool,
    /// Links a regenerated answer to the message it replaces.
    pub parent_turn_index: Option<u64>,
    pub used_persona_id: Option<String>,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn text(
        session_id: impl Into<String>,
        turn_index: u64,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            turn_index,
            role,
            content: serde_json::Value::String(content.into()),
            token_estimate: 0,
            truncated: false,
            parent_turn_index: None,
            used_persona_id: None,
            deleted: false,
            metadata: None,
            created_at: Utc::now(),
        }
    }
}
