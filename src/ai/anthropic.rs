use std::fmt::Display;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rig::client::CompletionClient;
use rig::completion::Chat;
use rig::providers;
use rig::streaming::{StreamedAssistantContent, StreamingCompletion};

use super::{ChatError, ChatResult, GenerationRequest, LLMBackend, TokenSink};
use crate::types::{ChatMessage, Role};

/// Claude through a Rig agent.
pub struct AnthropicBackend {
    client: providers::anthropic::Client,
    model: String,
}

impl AnthropicBackend {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: providers::anthropic::Client::new(api_key),
            model: model.to_string(),
        }
    }

    /// Convert history to Rig's message format
    fn convert_to_rig_messages(history: &[ChatMessage]) -> Vec<rig::message::Message> {
        history
            .iter()
            .map(|msg| match msg.role {
                Role::User => rig::message::Message::user(&msg.content),
                Role::Assistant => rig::message::Message::assistant(&msg.content),
            })
            .collect()
    }
}

fn provider_error(err: impl Display) -> ChatError {
    ChatError::Provider(format!("anthropic: {err}"))
}

/// Push each text delta into the sink as it arrives. `None` items carry no
/// text (tool calls, reasoning, the final usage record) and are skipped.
pub(crate) async fn forward_deltas<S, E>(mut deltas: S, sink: &mut TokenSink) -> ChatResult<()>
where
    S: Stream<Item = Result<Option<String>, E>> + Unpin,
    E: Display,
{
    while let Some(item) = deltas.next().await {
        if let Some(text) = item.map_err(provider_error)? {
            sink.push(&text).await;
        }
    }
    Ok(())
}

#[async_trait]
impl LLMBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &GenerationRequest) -> ChatResult<String> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(&request.system_prompt)
            .max_tokens(request.max_tokens)
            .temperature(request.temperature)
            .build();

        let history = Self::convert_to_rig_messages(&request.history);
        agent
            .chat(request.message.as_str(), history)
            .await
            .map_err(provider_error)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(&self, request: &GenerationRequest, sink: &mut TokenSink) -> ChatResult<()> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(&request.system_prompt)
            .max_tokens(request.max_tokens)
            .temperature(request.temperature)
            .build();

        let history = Self::convert_to_rig_messages(&request.history);
        let response = agent
            .stream_completion(request.message.as_str(), history)
            .await
            .map_err(provider_error)?
            .stream()
            .await
            .map_err(provider_error)?;

        let deltas = Box::pin(response.map(|item| {
            item.map(|content| match content {
                StreamedAssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
        }));
        forward_deltas(deltas, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn deltas_reach_the_sink_one_by_one() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = TokenSink::new(tx);
        let deltas = futures::stream::iter(vec![
            Ok::<_, String>(Some("The unexamined ".to_string())),
            Ok(None),
            Ok(Some("life is not ".to_string())),
            Ok(Some("worth living.".to_string())),
        ]);

        forward_deltas(deltas, &mut sink).await.unwrap();
        assert_eq!(sink.pieces(), 3);
        assert_eq!(sink.text(), "The unexamined life is not worth living.");
        drop(sink);

        let mut contents = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Content(piece) = event {
                contents.push(piece);
            }
        }
        assert_eq!(contents, vec!["The unexamined ", "life is not ", "worth living."]);
    }

    #[tokio::test]
    async fn stream_error_keeps_earlier_text() {
        let mut sink = TokenSink::detached();
        let deltas = futures::stream::iter(vec![
            Ok(Some("Partial".to_string())),
            Err("overloaded"),
        ]);

        let err = forward_deltas(deltas, &mut sink).await.unwrap_err();
        assert_eq!(err.to_string(), "anthropic: overloaded");
        assert_eq!(sink.text(), "Partial");
    }

    #[test]
    fn claims_streaming() {
        assert!(AnthropicBackend::new("key", "claude-3-5-sonnet-20241022").supports_streaming());
    }
}
