//! Client-side cache of the server-confirmed message list.

use std::sync::Arc;

use super::api::{ChatTransport, ClientResult};
use crate::types::Message;

/// Cached persisted messages of one conversation.
///
/// The list is only ever replaced wholesale by a refetch; nothing appends
/// to it locally. A failed refetch keeps the previous list and leaves the
/// cache stale.
pub struct MessageCache<T: ?Sized> {
    transport: Arc<T>,
    key: Option<String>,
    messages: Vec<Message>,
    stale: bool,
}

impl<T: ChatTransport + ?Sized> MessageCache<T> {
    /// Starts stale, keyed to the session's current conversation.
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            key: None,
            messages: Vec::new(),
            stale: true,
        }
    }

    /// `None` is the session's current conversation.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn get(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub async fn refetch(&mut self) -> ClientResult<&[Message]> {
        let fresh = match self.transport.fetch_messages(self.key.as_deref()).await {
            Ok(fresh) => fresh,
            Err(err) => {
                self.stale = true;
                return Err(err);
            }
        };
        tracing::debug!(count = fresh.len(), "message list refetched");
        self.messages = fresh;
        self.stale = false;
        Ok(&self.messages)
    }

    pub async fn invalidate_and_refetch(&mut self) -> ClientResult<&[Message]> {
        self.invalidate();
        self.refetch().await
    }

    /// Point the cache at another conversation. The old list is dropped at
    /// once so it can never be compared against the new conversation.
    pub fn switch_to(&mut self, key: Option<String>) {
        self.key = key;
        self.messages.clear();
        self.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::api::{ByteStream, ClientError};
    use crate::types::{ChatMode, ChatRequest, Conversation, Role};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use time::OffsetDateTime;

    #[derive(Default)]
    struct Listing {
        calls: Mutex<Vec<Option<String>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ChatTransport for Listing {
        async fn open_stream(&self, _: ChatMode, _: &ChatRequest) -> ClientResult<ByteStream> {
            unimplemented!()
        }

        async fn fetch_messages(&self, conversation_id: Option<&str>) -> ClientResult<Vec<Message>> {
            self.calls
                .lock()
                .unwrap()
                .push(conversation_id.map(str::to_string));
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Status {
                    status: 503,
                    body: String::new(),
                });
            }
            Ok(vec![Message {
                id: "m1".into(),
                conversation_id: conversation_id.unwrap_or("current").into(),
                role: Role::User,
                content: "hi".into(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            }])
        }

        async fn delete_message(&self, _: &str) -> ClientResult<()> {
            Ok(())
        }

        async fn new_conversation(&self) -> ClientResult<Conversation> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn refetch_replaces_list_and_clears_staleness() {
        let mut cache = MessageCache::new(Arc::new(Listing::default()));
        assert!(cache.is_stale());
        assert!(cache.is_empty());
        cache.invalidate_and_refetch().await.unwrap();
        assert!(!cache.is_stale());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get()[0].conversation_id, "current");
    }

    #[tokio::test]
    async fn failed_refetch_keeps_previous_list() {
        let transport = Arc::new(Listing::default());
        let mut cache = MessageCache::new(transport.clone());
        cache.refetch().await.unwrap();
        assert!(!cache.is_stale());

        transport.fail.store(true, Ordering::SeqCst);
        assert!(cache.refetch().await.is_err());
        assert!(cache.is_stale());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get()[0].id, "m1");

        assert!(cache.invalidate_and_refetch().await.is_err());
        assert_eq!(cache.len(), 1);

        transport.fail.store(false, Ordering::SeqCst);
        cache.refetch().await.unwrap();
        assert!(!cache.is_stale());
    }

    #[tokio::test]
    async fn switching_drops_list_and_uses_new_key() {
        let transport = Arc::new(Listing::default());
        let mut cache = MessageCache::new(transport.clone());
        cache.refetch().await.unwrap();
        cache.switch_to(Some("c2".into()));
        assert!(cache.is_empty());
        assert!(cache.is_stale());
        assert_eq!(cache.key(), Some("c2"));
        cache.refetch().await.unwrap();
        assert_eq!(
            *transport.calls.lock().unwrap(),
            vec![None, Some("c2".to_string())]
        );
    }
}
