use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{MessageRepository, StorageError, StorageResult};
use crate::types::{Conversation, Message, Role, now};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
}

pub struct LocalRepository {
    state: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

impl LocalRepository {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            path: None,
        }
    }

    /// Load the snapshot at `path`, or start empty if the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(err) => return Err(err.into()),
        };
        tracing::info!(
            path = %path.display(),
            conversations = snapshot.conversations.len(),
            messages = snapshot.messages.len(),
            "message store opened"
        );
        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    /// `messages.json` under the platform data directory.
    pub fn default_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            return data_dir.join("sophia").join("messages.json");
        }
        PathBuf::from("cache").join("messages.json")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl MessageRepository for LocalRepository {
    async fn create_conversation(&self, session_id: &str, title: Option<String>) -> StorageResult<Conversation> {
        let conversation = Conversation {
            id: new_id(),
            session_id: session_id.to_string(),
            title,
            created_at: now(),
        };
        let mut state = self.state.write().await;
        state.conversations.push(conversation.clone());
        if let Err(err) = self.persist(&state).await {
            state.conversations.pop();
            return Err(err);
        }
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state.conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn current_conversation(&self, session_id: &str) -> StorageResult<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .iter()
            .rev()
            .find(|c| c.session_id == session_id)
            .cloned())
    }

    async fn list_conversations(&self, session_id: &str) -> StorageResult<Vec<Conversation>> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .iter()
            .rev()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn list_messages(&self, conversation_id: &str) -> StorageResult<Vec<Message>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn append_turn(&self, conversation_id: &str, user: &str, assistant: &str) -> StorageResult<(Message, Message)> {
        let mut state = self.state.write().await;
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(StorageError::ConversationNotFound(conversation_id.to_string()));
        }

        let at = now();
        let user = Message {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content: user.to_string(),
            created_at: at,
        };
        let assistant = Message {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            content: assistant.to_string(),
            created_at: at,
        };

        state.messages.push(user.clone());
        state.messages.push(assistant.clone());
        if let Err(err) = self.persist(&state).await {
            let keep = state.messages.len() - 2;
            state.messages.truncate(keep);
            return Err(err);
        }
        Ok((user, assistant))
    }

    async fn delete_message(&self, session_id: &str, message_id: &str) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        let Some(index) = state.messages.iter().position(|m| m.id == message_id) else {
            return Ok(false);
        };
        let owner = &state.messages[index].conversation_id;
        let owned = state
            .conversations
            .iter()
            .any(|c| &c.id == owner && c.session_id == session_id);
        if !owned {
            return Ok(false);
        }

        let removed = state.messages.remove(index);
        if let Err(err) = self.persist(&state).await {
            state.messages.insert(index, removed);
            return Err(err);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_conversation_is_the_latest_one() {
        let repo = LocalRepository::in_memory();
        assert!(repo.current_conversation("s1").await.unwrap().is_none());
        let first = repo.create_conversation("s1", None).await.unwrap();
        let second = repo
            .create_conversation("s1", Some("Second".into()))
            .await
            .unwrap();
        repo.create_conversation("s2", None).await.unwrap();

        let current = repo.current_conversation("s1").await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        let ids: Vec<String> = repo
            .list_conversations("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn append_turn_writes_user_then_assistant() {
        let repo = LocalRepository::in_memory();
        let conversation = repo.create_conversation("s1", None).await.unwrap();
        let (user, assistant) = repo
            .append_turn(&conversation.id, "What is virtue?", "Virtue is knowledge.")
            .await
            .unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(assistant.role, Role::Assistant);

        let messages = repo.list_messages(&conversation.id).await.unwrap();
        assert_eq!(messages, vec![user, assistant]);
    }

    #[tokio::test]
    async fn append_turn_to_unknown_conversation_writes_nothing() {
        let repo = LocalRepository::in_memory();
        let err = repo.append_turn("missing", "q", "a").await.unwrap_err();
        assert!(matches!(err, StorageError::ConversationNotFound(_)));
        assert!(repo.list_messages("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let repo = LocalRepository::in_memory();
        let conversation = repo.create_conversation("owner", None).await.unwrap();
        let (user, _) = repo.append_turn(&conversation.id, "q", "a").await.unwrap();

        assert!(!repo.delete_message("intruder", &user.id).await.unwrap());
        assert!(repo.delete_message("owner", &user.id).await.unwrap());
        assert!(!repo.delete_message("owner", &user.id).await.unwrap());
        assert_eq!(repo.list_messages(&conversation.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("messages.json");

        let repo = LocalRepository::open(&path).await.unwrap();
        let conversation = repo.create_conversation("s1", None).await.unwrap();
        repo.append_turn(&conversation.id, "q", "a").await.unwrap();
        drop(repo);

        let reopened = LocalRepository::open(&path).await.unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        let messages = reopened.list_messages(&conversation.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "a");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = LocalRepository::open(&path).await.err().unwrap();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }
}
