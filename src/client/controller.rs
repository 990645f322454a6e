//! Drives one chat view: send, stream, settle, refetch, reconcile.

use std::fmt::Display;
use std::sync::Arc;

use tokio::sync::watch;

use super::api::{ChatTransport, ClientResult};
use super::notify::{Notification, Notifier};
use super::session::{AuditLog, ChatSession, Reconciliation, RenderedMessage, SessionError, TurnPhase};
use super::store::MessageCache;
use crate::stream::read_events;
use crate::types::{ChatRequest, Message};

/// Snapshot published to observers after every state change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatView {
    pub messages: Vec<RenderedMessage>,
    pub phase: TurnPhase,
    pub is_streaming: bool,
    pub audit_mode: bool,
    pub audit: AuditLog,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The end marker arrived and the follow-up refetch ran.
    Completed {
        events: usize,
        skipped: usize,
        reconciled: Reconciliation,
    },
    /// Transport failed; every pending copy was dropped and the user notified.
    Failed,
}

pub struct ChatController<T: ChatTransport + ?Sized, N: Notifier> {
    transport: Arc<T>,
    cache: MessageCache<T>,
    session: ChatSession,
    notifier: N,
    figure_id: Option<String>,
    view: watch::Sender<ChatView>,
}

fn publish(view: &watch::Sender<ChatView>, session: &ChatSession, persisted: &[Message]) {
    view.send_replace(ChatView {
        messages: session.render(persisted),
        phase: session.phase(),
        is_streaming: session.is_streaming(),
        audit_mode: session.audit_mode(),
        audit: session.audit().clone(),
    });
}

impl<T: ChatTransport + ?Sized, N: Notifier> ChatController<T, N> {
    pub fn new(transport: Arc<T>, notifier: N) -> Self {
        let (view, _) = watch::channel(ChatView::default());
        Self {
            cache: MessageCache::new(transport.clone()),
            transport,
            session: ChatSession::new(),
            notifier,
            figure_id: None,
            view,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.view.subscribe()
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn persisted(&self) -> &[Message] {
        self.cache.get()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.cache.key()
    }

    pub fn render(&self) -> Vec<RenderedMessage> {
        self.session.render(self.cache.get())
    }

    pub fn set_audit_mode(&mut self, on: bool) -> Result<(), SessionError> {
        self.session.set_audit_mode(on)?;
        self.publish();
        Ok(())
    }

    pub fn set_figure(&mut self, figure_id: Option<String>) {
        self.figure_id = figure_id;
    }

    fn publish(&self) {
        publish(&self.view, &self.session, self.cache.get());
    }

    /// Initial fetch of the current conversation.
    pub async fn load(&mut self) -> ClientResult<()> {
        let result = self.cache.refetch().await.map(|_| ());
        self.session.reconcile(self.cache.get());
        self.publish();
        result
    }

    /// Run one full turn.
    ///
    /// Only a refused send is an error. Transport failures are turned into a
    /// notification and [`TurnOutcome::Failed`].
    pub async fn send(&mut self, text: &str, document_text: Option<String>) -> Result<TurnOutcome, SessionError> {
        let mode = self.session.begin_send(text, self.cache.len())?;
        self.publish();

        let request = ChatRequest {
            message: text.to_string(),
            document_text,
            figure_id: self.figure_id.clone(),
            conversation_id: self.cache.key().map(str::to_string),
        };

        let body = match self.transport.open_stream(mode, &request).await {
            Ok(body) => body,
            Err(err) => return Ok(self.fail_turn(&err)),
        };

        let session = &mut self.session;
        let cache = &self.cache;
        let view = &self.view;
        let read = read_events(body, |event| {
            session.apply(event, cache.len());
            publish(view, session, cache.get());
        })
        .await;

        match read {
            Ok(summary) => {
                let reconciled = self.refresh().await;
                Ok(TurnOutcome::Completed {
                    events: summary.events,
                    skipped: summary.skipped,
                    reconciled,
                })
            }
            Err(err) => Ok(self.fail_turn(&err)),
        }
    }

    fn fail_turn(&mut self, err: &impl Display) -> TurnOutcome {
        tracing::warn!(error = %err, "chat turn failed");
        self.session.fail();
        self.notifier
            .notify(Notification::new("Failed to send message", err.to_string()));
        self.publish();
        TurnOutcome::Failed
    }

    /// Refetch and reconcile. Any caller may trigger this at any time.
    pub async fn refresh(&mut self) -> Reconciliation {
        if let Err(err) = self.cache.invalidate_and_refetch().await {
            tracing::warn!(error = %err, "message refetch failed; pending messages kept");
        }
        let outcome = self.session.reconcile(self.cache.get());
        self.publish();
        outcome
    }

    pub async fn delete_message(&mut self, id: &str) -> ClientResult<()> {
        self.transport.delete_message(id).await?;
        self.refresh().await;
        Ok(())
    }

    pub async fn new_conversation(&mut self) -> ClientResult<String> {
        let conversation = self.transport.new_conversation().await?;
        self.switch_conversation(Some(conversation.id.clone())).await?;
        Ok(conversation.id)
    }

    pub async fn switch_conversation(&mut self, id: Option<String>) -> ClientResult<()> {
        self.session.reset_for_conversation();
        self.cache.switch_to(id);
        self.publish();
        self.load().await
    }
}
