/// Durable conversation and message storage.
///
/// The server only talks to [`MessageRepository`]. [`LocalRepository`] keeps
/// everything in memory and, when opened on a path, mirrors it to a JSON file.
mod local;

pub use local::LocalRepository;

use async_trait::async_trait;

use crate::types::{Conversation, Message};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create_conversation(&self, session_id: &str, title: Option<String>) -> StorageResult<Conversation>;

    async fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>>;

    /// Most recently created conversation of the session.
    async fn current_conversation(&self, session_id: &str) -> StorageResult<Option<Conversation>>;

    /// Conversations of the session, newest first.
    async fn list_conversations(&self, session_id: &str) -> StorageResult<Vec<Conversation>>;

    /// Messages in the order they were written.
    async fn list_messages(&self, conversation_id: &str) -> StorageResult<Vec<Message>>;

    /// Write one user row and one assistant row. Either both land or neither does.
    async fn append_turn(&self, conversation_id: &str, user: &str, assistant: &str) -> StorageResult<(Message, Message)>;

    /// Delete a message owned by the session. Returns false if there was none.
    async fn delete_message(&self, session_id: &str, message_id: &str) -> StorageResult<bool>;
}
