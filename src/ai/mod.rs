/// Generation backends for persona replies.
///
/// Every backend implements [`LLMBackend`]. Streaming backends push tokens
/// into a [`TokenSink`] as they arrive; the rest produce the whole reply and
/// push it once.
///
/// - `openai` - OpenAI-compatible chat completions over SSE (OpenAI, xAI, DeepSeek)
/// - `anthropic` - Claude through a Rig agent
/// - `fallback` - tries backends in order
mod anthropic;
mod fallback;
mod openai;

pub use anthropic::AnthropicBackend;
pub use fallback::FallbackBackend;
pub use openai::{OpenAiCompatibleBackend, parse_completion_chunk};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::stream::StreamEvent;
use crate::types::ChatMessage;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{0}")]
    Provider(String),
    #[error("no AI provider configured; set OPENAI_API_KEY, ANTHROPIC_API_KEY, DEEPSEEK_API_KEY or XAI_API_KEY")]
    NotConfigured,
}

pub type ChatResult<T> = Result<T, ChatError>;

/// One generation call.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub system_prompt: String,
    /// Earlier turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub message: String,
    pub max_tokens: u64,
    pub temperature: f64,
}

/// Receives generated text and forwards each piece to the response stream.
///
/// Text keeps accumulating after the receiver is gone, so a turn whose
/// client disconnected can still be persisted.
pub struct TokenSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
    text: String,
    pieces: usize,
}

impl TokenSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx: Some(tx),
            text: String::new(),
            pieces: 0,
        }
    }

    /// Collect without forwarding.
    pub fn detached() -> Self {
        Self {
            tx: None,
            text: String::new(),
            pieces: 0,
        }
    }

    pub async fn push(&mut self, piece: &str) {
        if piece.is_empty() {
            return;
        }
        self.text.push_str(piece);
        self.pieces += 1;
        if let Some(tx) = &self.tx
            && tx.send(StreamEvent::Content(piece.to_string())).await.is_err()
        {
            tracing::debug!("client went away; generation continues");
            self.tx = None;
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Pieces pushed so far.
    pub fn pieces(&self) -> usize {
        self.pieces
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[async_trait]
pub trait LLMBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &GenerationRequest) -> ChatResult<String>;

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn stream(&self, request: &GenerationRequest, sink: &mut TokenSink) -> ChatResult<()> {
        let text = self.complete(request).await?;
        sink.push(&text).await;
        Ok(())
    }
}

/// Build the backend chain from whichever provider keys are set.
///
/// Order: OpenAI, Anthropic, DeepSeek, xAI. More than one configured
/// provider yields a [`FallbackBackend`].
pub fn backend_from_config(config: &ProviderConfig) -> ChatResult<Arc<dyn LLMBackend>> {
    let mut chain: Vec<Arc<dyn LLMBackend>> = Vec::new();

    if let Some(key) = &config.openai_api_key {
        chain.push(Arc::new(OpenAiCompatibleBackend::new(
            "openai",
            &config.openai_base_url,
            key,
            &config.openai_model,
        )));
    }
    if let Some(key) = &config.anthropic_api_key {
        chain.push(Arc::new(AnthropicBackend::new(key, &config.anthropic_model)));
    }
    if let Some(key) = &config.deepseek_api_key {
        chain.push(Arc::new(OpenAiCompatibleBackend::new(
            "deepseek",
            "https://api.deepseek.com/v1",
            key,
            "deepseek-chat",
        )));
    }
    if let Some(key) = &config.xai_api_key {
        chain.push(Arc::new(OpenAiCompatibleBackend::new(
            "xai",
            "https://api.x.ai/v1",
            key,
            "grok-3",
        )));
    }

    let names: Vec<&str> = chain.iter().map(|b| b.name()).collect();
    tracing::info!(backends = ?names, "generation backends configured");

    match chain.len() {
        0 => Err(ChatError::NotConfigured),
        1 => Ok(chain.remove(0)),
        _ => Ok(Arc::new(FallbackBackend::new(chain))),
    }
}
