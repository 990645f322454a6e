use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Id of the optimistic user bubble shown until the server confirms it.
pub const PENDING_USER_ID: &str = "pending-user";
/// Id of the assistant bubble while tokens are still arriving.
pub const STREAMING_ID: &str = "streaming";
/// Id of the assistant bubble after the stream ended but before persistence is observed.
pub const PENDING_ID: &str = "pending";

/// Header carrying the caller's session identity.
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Role/content pair handed to model backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single turn of a conversation.
///
/// Persisted messages are never edited; the only mutation is deleting the
/// whole row. The reserved ids above only ever appear on client-side
/// synthetic copies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Build a client-side message that is never written anywhere.
    pub fn transient(id: &str, role: Role, content: &str, created_at: OffsetDateTime) -> Self {
        Self {
            id: id.to_string(),
            conversation_id: String::new(),
            role,
            content: content.to_string(),
            created_at,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.id.as_str(), PENDING_USER_ID | STREAMING_ID | PENDING_ID)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Row of the chat history listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub preview: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Body of both streaming endpoints.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figure_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Selects the streaming endpoint. This is the only transport-level branch on mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChatMode {
    #[default]
    Standard,
    Audited,
}

impl ChatMode {
    pub fn endpoint(&self) -> &'static str {
        match self {
            ChatMode::Standard => "/api/chat/stream",
            ChatMode::Audited => "/api/chat/stream-audited",
        }
    }

    pub fn is_audited(&self) -> bool {
        matches!(self, ChatMode::Audited)
    }
}

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
