use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};
use crate::types::{Conversation, DEFAULT_CONVERSATION_TITLE, Message, Role, User};

/// Timestamp (de)serialization tolerant of the backend's naive ISO-8601.
///
/// The server emits `datetime.isoformat()` without a timezone suffix; those
/// values are UTC by convention, so both RFC 3339 and naive forms must parse.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(parsed.with_timezone(&Utc));
        }

        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|error| format!("unrecognized timestamp '{raw}': {error}"))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(inner) => super::serialize(inner, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| super::parse(&value).map_err(de::Error::custom))
                .transpose()
        }
    }
}

// ---------- chat ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub conversation_id: ConversationId,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDto {
    pub id: ConversationId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub turn_count: u32,
}

impl ConversationDto {
    /// The create endpoint omits `updated_at`; fall back to creation time.
    pub fn into_conversation(self) -> Conversation {
        let title = self
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string());

        Conversation {
            id: self.id,
            title,
            turn_count: self.turn_count,
            updated_at: self.updated_at.unwrap_or(self.created_at),
        }
    }
}

/// Message payloads omit the conversation id because the history endpoint is
/// already scoped to one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub turn_number: u32,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl MessageDto {
    pub fn into_message(self, conversation_id: ConversationId) -> Message {
        Message {
            id: self.id,
            conversation_id,
            role: self.role,
            content: self.content,
            turn_number: self.turn_number,
            created_at: self.created_at,
        }
    }
}

/// One server-sent event on the message stream.
///
/// `complete` carries the persisted assistant message; the promoted content
/// is still assembled client-side from the chunks received in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk {
        content: String,
    },
    Complete {
        message: CompletedMessageDto,
    },
    Error {
        #[serde(alias = "content", alias = "detail")]
        message: String,
    },
}

/// The `complete` event's message body. Unlike history payloads this one has
/// no role field; it is always the assistant turn that just finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedMessageDto {
    pub id: MessageId,
    pub content: String,
    pub turn_number: u32,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

// ---------- auth ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleAuthRequest {
    pub id_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDto {
    pub id: UserId,
    pub username: String,
    pub email: String,
}

impl UserDto {
    pub fn into_user(self) -> User {
        User {
            id: self.id,
            username: self.username,
            email: self.email,
        }
    }
}
