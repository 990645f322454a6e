use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ChatError, ChatResult, GenerationRequest, LLMBackend, TokenSink};
use crate::stream::LineBuffer;

/// Any endpoint speaking the OpenAI chat completions protocol.
pub struct OpenAiCompatibleBackend {
    client: Client,
    name: String,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleBackend {
    pub fn new(name: &str, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            name: name.to_string(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u64,
    temperature: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl<'a> CompletionRequest<'a> {
    fn new(model: &'a str, request: &'a GenerationRequest, stream: bool) -> Self {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(WireMessage {
            role: "system",
            content: &request.system_prompt,
        });
        messages.extend(request.history.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));
        messages.push(WireMessage {
            role: "user",
            content: &request.message,
        });
        Self {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        }
    }
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

/// Parse the data of one upstream SSE line into `(piece, done)`.
pub fn parse_completion_chunk(data: &str) -> Option<(String, bool)> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "[DONE]" {
        return Some((String::new(), true));
    }
    let parsed = serde_json::from_str::<CompletionResponse>(trimmed).ok()?;
    let piece = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| {
            choice
                .delta
                .and_then(|d| d.content)
                .or_else(|| choice.message.and_then(|m| m.content))
        })
        .unwrap_or_default();
    Some((piece, false))
}

impl OpenAiCompatibleBackend {
    async fn send(&self, request: &GenerationRequest, stream: bool) -> ChatResult<reqwest::Response> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest::new(&self.model, request, stream))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status {
                provider: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LLMBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &GenerationRequest) -> ChatResult<String> {
        let body = self.send(request, false).await?.text().await?;
        match parse_completion_chunk(&body) {
            Some((content, _)) => Ok(content),
            None => Err(ChatError::Provider(format!(
                "{} returned an unreadable completion",
                self.name
            ))),
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(&self, request: &GenerationRequest, sink: &mut TokenSink) -> ChatResult<()> {
        let response = self.send(request, true).await?;
        let mut lines = LineBuffer::default();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            for line in lines.push(&chunk?) {
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                if let Some((piece, done)) = parse_completion_chunk(data) {
                    sink.push(&piece).await;
                    if done {
                        return Ok(());
                    }
                }
            }
        }

        // Some servers close the body without a final [DONE].
        Ok(())
    }
}
