use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatError, ChatResult, GenerationRequest, LLMBackend, TokenSink};

/// Tries each backend in turn.
///
/// A backend that already pushed text is never followed by another one, so
/// the client never sees two replies spliced together.
pub struct FallbackBackend {
    chain: Vec<Arc<dyn LLMBackend>>,
}

impl FallbackBackend {
    pub fn new(chain: Vec<Arc<dyn LLMBackend>>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl LLMBackend for FallbackBackend {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn complete(&self, request: &GenerationRequest) -> ChatResult<String> {
        let mut last = ChatError::NotConfigured;
        for backend in &self.chain {
            match backend.complete(request).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    tracing::warn!(backend = backend.name(), error = %err, "backend failed; trying next");
                    last = err;
                }
            }
        }
        Err(last)
    }

    fn supports_streaming(&self) -> bool {
        self.chain.iter().any(|b| b.supports_streaming())
    }

    async fn stream(&self, request: &GenerationRequest, sink: &mut TokenSink) -> ChatResult<()> {
        let mut last = ChatError::NotConfigured;
        for backend in &self.chain {
            let before = sink.pieces();
            match backend.stream(request, sink).await {
                Ok(()) => return Ok(()),
                Err(err) if sink.pieces() == before => {
                    tracing::warn!(backend = backend.name(), error = %err, "backend failed; trying next");
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        reply: Result<&'static str, &'static str>,
        partial: Option<&'static str>,
    }

    #[async_trait]
    impl LLMBackend for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(&self, _: &GenerationRequest) -> ChatResult<String> {
            self.reply
                .map(str::to_string)
                .map_err(|e| ChatError::Provider(e.to_string()))
        }

        async fn stream(&self, request: &GenerationRequest, sink: &mut TokenSink) -> ChatResult<()> {
            if let Some(piece) = self.partial {
                sink.push(piece).await;
            }
            let text = self.complete(request).await?;
            sink.push(&text).await;
            Ok(())
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_prompt: String::new(),
            history: Vec::new(),
            message: "q".into(),
            max_tokens: 16,
            temperature: 0.0,
        }
    }

    fn chain(backends: Vec<Fixed>) -> FallbackBackend {
        FallbackBackend::new(
            backends
                .into_iter()
                .map(|b| Arc::new(b) as Arc<dyn LLMBackend>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn moves_on_when_nothing_was_emitted() {
        let backend = chain(vec![
            Fixed { name: "a", reply: Err("down"), partial: None },
            Fixed { name: "b", reply: Ok("answer"), partial: None },
        ]);
        let mut sink = TokenSink::detached();
        backend.stream(&request(), &mut sink).await.unwrap();
        assert_eq!(sink.text(), "answer");
        assert_eq!(backend.complete(&request()).await.unwrap(), "answer");
    }

    #[tokio::test]
    async fn stops_after_partial_output() {
        let backend = chain(vec![
            Fixed { name: "a", reply: Err("dropped"), partial: Some("Virtue ") },
            Fixed { name: "b", reply: Ok("other"), partial: None },
        ]);
        let mut sink = TokenSink::detached();
        let err = backend.stream(&request(), &mut sink).await.unwrap_err();
        assert_eq!(err.to_string(), "dropped");
        assert_eq!(sink.text(), "Virtue ");
    }

    #[tokio::test]
    async fn reports_the_last_error_when_all_fail() {
        let backend = chain(vec![
            Fixed { name: "a", reply: Err("first"), partial: None },
            Fixed { name: "b", reply: Err("second"), partial: None },
        ]);
        let err = backend.complete(&request()).await.unwrap_err();
        assert_eq!(err.to_string(), "second");
    }
}
