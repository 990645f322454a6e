use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;

use crate::persona::PersonaSummary;
use crate::types::{ChatMode, ChatRequest, Conversation, ConversationSummary, Message, SESSION_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Raw response body of a streaming endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

/// Everything the chat view needs from the server.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open a streaming turn. A non-2xx status is an error and yields no body.
    async fn open_stream(&self, mode: ChatMode, request: &ChatRequest) -> ClientResult<ByteStream>;

    /// Persisted messages of a conversation; `None` means the session's current one.
    async fn fetch_messages(&self, conversation_id: Option<&str>) -> ClientResult<Vec<Message>>;

    async fn delete_message(&self, id: &str) -> ClientResult<()>;

    async fn new_conversation(&self) -> ClientResult<Conversation>;
}

/// HTTP implementation of [`ChatTransport`].
#[derive(Clone)]
pub struct ChatApi {
    client: Client,
    base_url: String,
    session_id: String,
}

#[derive(Deserialize)]
struct ConversationEnvelope {
    conversation: Conversation,
}

#[derive(Deserialize)]
struct HistoryEnvelope {
    conversations: Vec<ConversationSummary>,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, &self.session_id)
    }

    async fn checked(response: Response) -> ClientResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Non-empty conversations of this session, newest first.
    pub async fn chat_history(&self) -> ClientResult<Vec<ConversationSummary>> {
        let response = self.request(Method::GET, "/api/chat-history").send().await?;
        let envelope: HistoryEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.conversations)
    }

    pub async fn figures(&self) -> ClientResult<Vec<PersonaSummary>> {
        let response = self.request(Method::GET, "/api/figures").send().await?;
        Ok(Self::checked(response).await?.json().await?)
    }
}

#[async_trait]
impl ChatTransport for ChatApi {
    async fn open_stream(&self, mode: ChatMode, request: &ChatRequest) -> ClientResult<ByteStream> {
        let response = self
            .request(Method::POST, mode.endpoint())
            .header("accept", "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = Self::checked(response).await?;
        tracing::debug!(endpoint = mode.endpoint(), "stream opened");
        Ok(response.bytes_stream().map(|item| item.map_err(ClientError::from)).boxed())
    }

    async fn fetch_messages(&self, conversation_id: Option<&str>) -> ClientResult<Vec<Message>> {
        let mut request = self.request(Method::GET, "/api/messages");
        if let Some(id) = conversation_id {
            request = request.query(&[("conversationId", id)]);
        }
        let response = Self::checked(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn delete_message(&self, id: &str) -> ClientResult<()> {
        let response = self
            .request(Method::DELETE, &format!("/api/messages/{id}"))
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn new_conversation(&self) -> ClientResult<Conversation> {
        let response = self.request(Method::POST, "/api/chat/new").send().await?;
        let envelope: ConversationEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.conversation)
    }
}
