use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};

/// Title assigned when the server returns a conversation without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Chat speaker role. Persisted history only ever contains user and
/// assistant turns; system prompting happens server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Authenticated account identity, owned by the auth collaborator and
/// read-only to the chat engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
}

/// One conversation as the sidebar sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub turn_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// One immutable, persisted message within a conversation.
///
/// Ordering inside a conversation is by `turn_number`, ties broken by
/// arrival order; the timeline enforces strict increase on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub turn_number: u32,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of the single in-flight assistant reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftStatus {
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// An assistant reply still under construction. Never part of persisted
/// history; promoted to a [`Message`] only on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingDraft {
    pub conversation_id: ConversationId,
    pub accumulated_text: String,
    pub status: DraftStatus,
}

impl StreamingDraft {
    pub fn begin(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            accumulated_text: String::new(),
            status: DraftStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == DraftStatus::Active
    }
}
