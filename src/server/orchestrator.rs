//! Runs one chat turn and produces its event stream.
//!
//! Every event of a turn goes through one channel from one task, so the
//! client sees retrieval trace, tokens, report and end marker in exactly the
//! order they happened. Persistence happens once, after generation, and
//! writes the user and assistant rows together.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::ApiError;
use crate::ai::{GenerationRequest, LLMBackend, TokenSink};
use crate::persona::{Persona, PersonaRegistry};
use crate::retrieval::{Retriever, audit_report};
use crate::storage::MessageRepository;
use crate::stream::StreamEvent;
use crate::trace::{TraceEvent, TraceKind, TraceRecorder};
use crate::types::{ChatMessage, ChatMode, ChatRequest, Conversation};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<dyn MessageRepository>,
    personas: Arc<PersonaRegistry>,
    retriever: Arc<dyn Retriever>,
    backend: Arc<dyn LLMBackend>,
    history_limit: usize,
}

/// A validated turn, ready to run.
struct Turn {
    conversation: Conversation,
    persona: Persona,
    message: String,
    document_text: Option<String>,
    history: Vec<ChatMessage>,
    mode: ChatMode,
}

/// Prompt text for a message with an attached document.
pub fn with_document(message: &str, document_text: Option<&str>) -> String {
    match document_text.map(str::trim) {
        Some(doc) if !doc.is_empty() => format!(
            "[User has uploaded a document for discussion. Document content follows:]\n\n\
             {doc}\n\n[End of document]\n\n{message}"
        ),
        _ => message.to_string(),
    }
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        personas: Arc<PersonaRegistry>,
        retriever: Arc<dyn Retriever>,
        backend: Arc<dyn LLMBackend>,
        history_limit: usize,
    ) -> Self {
        Self {
            repo,
            personas,
            retriever,
            backend,
            history_limit,
        }
    }

    /// Validate the request and start the turn in the background.
    ///
    /// Errors are returned before any event is produced. Once this returns
    /// `Ok`, the receiver always ends with exactly one [`StreamEvent::Done`].
    pub async fn start_turn(
        &self,
        session_id: &str,
        request: ChatRequest,
        mode: ChatMode,
    ) -> Result<mpsc::Receiver<StreamEvent>, ApiError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(ApiError::BadRequest("Message is required".into()));
        }
        let persona = self
            .personas
            .resolve(request.figure_id.as_deref())
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
            .clone();
        let conversation = self
            .conversation_for(session_id, request.conversation_id.as_deref(), &persona)
            .await?;

        let mut previous = self.repo.list_messages(&conversation.id).await?;
        let skip = previous.len().saturating_sub(self.history_limit);
        let history = previous
            .drain(skip..)
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect();

        let turn = Turn {
            conversation,
            persona,
            message: message.to_string(),
            document_text: request.document_text,
            history,
            mode,
        };
        tracing::info!(
            conversation = %turn.conversation.id,
            persona = %turn.persona.id,
            audited = mode.is_audited(),
            "chat turn started"
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let this = self.clone();
        tokio::spawn(async move { this.run(turn, tx).await });
        Ok(rx)
    }

    async fn conversation_for(
        &self,
        session_id: &str,
        conversation_id: Option<&str>,
        persona: &Persona,
    ) -> Result<Conversation, ApiError> {
        if let Some(id) = conversation_id {
            let conversation = self
                .repo
                .get_conversation(id)
                .await?
                .ok_or_else(|| ApiError::NotFound("Conversation not found".into()))?;
            if conversation.session_id != session_id {
                return Err(ApiError::Forbidden("Access denied".into()));
            }
            return Ok(conversation);
        }
        match self.repo.current_conversation(session_id).await? {
            Some(conversation) => Ok(conversation),
            None => Ok(self
                .repo
                .create_conversation(session_id, Some(format!("Chat with {}", persona.name)))
                .await?),
        }
    }

    async fn run(self, turn: Turn, tx: mpsc::Sender<StreamEvent>) {
        let audited = turn.mode.is_audited();
        let mut recorder = if audited {
            TraceRecorder::streaming(tx.clone())
        } else {
            TraceRecorder::disabled()
        };

        let outcome = self
            .retriever
            .retrieve(&turn.message, &turn.persona, &mut recorder)
            .await;

        recorder
            .emit(
                TraceEvent::new(TraceKind::GenerationStart)
                    .with_message(format!("starting generation with {}", self.backend.name())),
            )
            .await;

        let request = GenerationRequest {
            system_prompt: format!("{}\n\n{}", turn.persona.system_prompt, outcome.instructions()),
            history: turn.history,
            message: with_document(&turn.message, turn.document_text.as_deref()),
            max_tokens: turn.persona.max_tokens,
            temperature: turn.persona.temperature,
        };

        let mut sink = TokenSink::new(tx.clone());
        let generated = self.backend.stream(&request, &mut sink).await;
        let pieces = sink.pieces();
        let reply = sink.into_text();

        match generated {
            Ok(()) if !reply.trim().is_empty() => {
                match self
                    .repo
                    .append_turn(&turn.conversation.id, &turn.message, &reply)
                    .await
                {
                    Ok(_) => tracing::debug!(
                        conversation = %turn.conversation.id,
                        pieces,
                        "turn persisted"
                    ),
                    Err(err) => tracing::warn!(
                        conversation = %turn.conversation.id,
                        error = %err,
                        "generated turn was not persisted"
                    ),
                }
            }
            Ok(()) => tracing::warn!("backend returned an empty reply; nothing persisted"),
            Err(err) => {
                tracing::error!(backend = self.backend.name(), error = %err, "generation failed");
                recorder
                    .emit(TraceEvent::new(TraceKind::Error).with_message(err.to_string()))
                    .await;
            }
        }

        if audited {
            let report = audit_report(&outcome, recorder.events());
            if tx.send(StreamEvent::AuditReport(report)).await.is_err() {
                tracing::debug!("client went away before the audit report");
            }
        }
        if tx.send(StreamEvent::Done).await.is_err() {
            tracing::debug!("client went away before the end marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_is_wrapped_around_the_message() {
        assert_eq!(with_document("q", None), "q");
        assert_eq!(with_document("q", Some("  ")), "q");
        let wrapped = with_document("Summarize this.", Some("The Republic, Book I"));
        assert!(wrapped.starts_with("[User has uploaded a document"));
        assert!(wrapped.contains("The Republic, Book I\n\n[End of document]"));
        assert!(wrapped.ends_with("Summarize this."));
    }
}
