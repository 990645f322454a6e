//! Reconciliation state machine for one conversation view.
//!
//! Three sources describe the same logical turn: the live stream buffer, the
//! optimistic pending copies, and the persisted list fetched from the server.
//! `ChatSession` keeps the first two as tagged unions so that combinations
//! such as "streaming while settled" cannot exist, and retires the optimistic
//! copies only when the persisted list provably contains them.

use time::OffsetDateTime;

use super::reconcile::{Shadow, Verdict};
use crate::stream::StreamEvent;
use crate::trace::TraceEvent;
use crate::types::{ChatMode, Message, PENDING_ID, PENDING_USER_ID, Role, STREAMING_ID, now};

#[derive(Clone, Debug, PartialEq)]
pub enum UserTrack {
    Idle,
    Pending {
        text: String,
        baseline: usize,
        created_at: OffsetDateTime,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum AssistantTrack {
    Idle,
    Streaming {
        buffer: String,
        started_at: OffsetDateTime,
    },
    Settled {
        text: String,
        /// Persisted count captured when the end marker arrived.
        baseline: usize,
        created_at: OffsetDateTime,
    },
}

/// Coarse view of where the current turn stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    Idle,
    UserPending,
    Streaming,
    StreamSettled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("a response is already streaming")]
    AlreadyStreaming,
    #[error("message is empty")]
    EmptyMessage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

/// What one reconciliation pass retired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub user_retired: bool,
    pub assistant_retired: bool,
}

impl Reconciliation {
    pub fn any(&self) -> bool {
        self.user_retired || self.assistant_retired
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditLog {
    pub events: Vec<TraceEvent>,
    pub report: Option<String>,
}

/// A message as the view should show it.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedMessage {
    pub message: Message,
    /// Still receiving tokens.
    pub streaming: bool,
}

#[derive(Clone, Debug)]
pub struct ChatSession {
    audit_mode: bool,
    user: UserTrack,
    assistant: AssistantTrack,
    audit: AuditLog,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            audit_mode: false,
            user: UserTrack::Idle,
            assistant: AssistantTrack::Idle,
            audit: AuditLog::default(),
        }
    }

    pub fn with_audit_mode(mut self, on: bool) -> Self {
        self.audit_mode = on;
        self
    }

    pub fn audit_mode(&self) -> bool {
        self.audit_mode
    }

    pub fn set_audit_mode(&mut self, on: bool) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::AlreadyStreaming);
        }
        self.audit_mode = on;
        Ok(())
    }

    pub fn mode(&self) -> ChatMode {
        if self.audit_mode {
            ChatMode::Audited
        } else {
            ChatMode::Standard
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.assistant, AssistantTrack::Streaming { .. })
    }

    pub fn phase(&self) -> TurnPhase {
        match (&self.assistant, &self.user) {
            (AssistantTrack::Streaming { .. }, _) => TurnPhase::Streaming,
            (AssistantTrack::Settled { .. }, _) => TurnPhase::StreamSettled,
            (AssistantTrack::Idle, UserTrack::Pending { .. }) => TurnPhase::UserPending,
            (AssistantTrack::Idle, UserTrack::Idle) => TurnPhase::Idle,
        }
    }

    pub fn user_track(&self) -> &UserTrack {
        &self.user
    }

    pub fn assistant_track(&self) -> &AssistantTrack {
        &self.assistant
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn pending_user_text(&self) -> Option<&str> {
        match &self.user {
            UserTrack::Pending { text, .. } => Some(text),
            UserTrack::Idle => None,
        }
    }

    pub fn streaming_text(&self) -> Option<&str> {
        match &self.assistant {
            AssistantTrack::Streaming { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    pub fn pending_assistant_text(&self) -> Option<&str> {
        match &self.assistant {
            AssistantTrack::Settled { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Start a turn. Returns the mode whose endpoint must carry it.
    ///
    /// A second send while tokens are still arriving is refused rather than
    /// queued. A settled-but-unreconciled bubble from the previous turn is
    /// dropped; its persisted copy shows up on the next refetch.
    pub fn begin_send(&mut self, text: &str, persisted_len: usize) -> Result<ChatMode, SessionError> {
        if self.is_streaming() {
            return Err(SessionError::AlreadyStreaming);
        }
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let at = now();
        self.user = UserTrack::Pending {
            text: text.to_string(),
            baseline: persisted_len,
            created_at: at,
        };
        self.assistant = AssistantTrack::Streaming {
            buffer: String::new(),
            started_at: at,
        };
        if self.audit_mode {
            self.audit = AuditLog::default();
        }
        Ok(self.mode())
    }

    /// Apply one decoded event. `persisted_len` is the cached persisted count
    /// right now; it becomes the assistant baseline when the stream ends.
    pub fn apply(&mut self, event: StreamEvent, persisted_len: usize) -> Flow {
        match event {
            StreamEvent::Content(piece) => {
                match &mut self.assistant {
                    AssistantTrack::Streaming { buffer, .. } => buffer.push_str(&piece),
                    _ => tracing::debug!("content outside of a streaming turn ignored"),
                }
                Flow::Continue
            }
            StreamEvent::Trace(trace) => {
                if self.audit_mode {
                    self.audit.events.push(trace);
                } else {
                    tracing::debug!(kind = ?trace.kind, "trace event ignored outside audit mode");
                }
                Flow::Continue
            }
            StreamEvent::AuditReport(report) => {
                if self.audit_mode {
                    self.audit.report = Some(report);
                }
                Flow::Continue
            }
            StreamEvent::Done => {
                self.settle(persisted_len);
                Flow::Finished
            }
        }
    }

    fn settle(&mut self, persisted_len: usize) {
        let previous = std::mem::replace(&mut self.assistant, AssistantTrack::Idle);
        match previous {
            AssistantTrack::Streaming { buffer, started_at } if !buffer.is_empty() => {
                self.assistant = AssistantTrack::Settled {
                    text: buffer,
                    baseline: persisted_len,
                    created_at: started_at,
                };
            }
            AssistantTrack::Streaming { .. } => {}
            other => self.assistant = other,
        }
    }

    /// Retire whichever pending copies the persisted list now contains.
    /// Safe to call any number of times with any snapshot.
    pub fn reconcile(&mut self, persisted: &[Message]) -> Reconciliation {
        let mut outcome = Reconciliation::default();

        if let UserTrack::Pending { text, baseline, .. } = &self.user
            && Shadow::new(Role::User, text, *baseline).verdict(persisted) == Verdict::Retire
        {
            self.user = UserTrack::Idle;
            outcome.user_retired = true;
        }

        if let AssistantTrack::Settled { text, baseline, .. } = &self.assistant
            && Shadow::new(Role::Assistant, text, *baseline).verdict(persisted) == Verdict::Retire
        {
            self.assistant = AssistantTrack::Idle;
            outcome.assistant_retired = true;
        }

        outcome
    }

    /// Transport failure: drop every optimistic copy.
    pub fn fail(&mut self) {
        self.user = UserTrack::Idle;
        self.assistant = AssistantTrack::Idle;
    }

    /// Baselines belong to one conversation; switching invalidates them.
    pub fn reset_for_conversation(&mut self) {
        self.fail();
        self.audit = AuditLog::default();
    }

    pub fn render(&self, persisted: &[Message]) -> Vec<RenderedMessage> {
        let mut out: Vec<RenderedMessage> = persisted
            .iter()
            .cloned()
            .map(|message| RenderedMessage {
                message,
                streaming: false,
            })
            .collect();

        if let UserTrack::Pending {
            text, created_at, ..
        } = &self.user
            && !text.is_empty()
        {
            out.push(RenderedMessage {
                message: Message::transient(PENDING_USER_ID, Role::User, text, *created_at),
                streaming: false,
            });
        }

        match &self.assistant {
            AssistantTrack::Streaming { buffer, started_at } if !buffer.is_empty() => {
                out.push(RenderedMessage {
                    message: Message::transient(STREAMING_ID, Role::Assistant, buffer, *started_at),
                    streaming: true,
                });
            }
            AssistantTrack::Settled {
                text, created_at, ..
            } => {
                out.push(RenderedMessage {
                    message: Message::transient(PENDING_ID, Role::Assistant, text, *created_at),
                    streaming: false,
                });
            }
            _ => {}
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceKind;

    fn persisted(id: &str, role: Role, content: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            role,
            content: content.into(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn stream(session: &mut ChatSession, pieces: &[&str], persisted_len: usize) {
        for piece in pieces {
            assert_eq!(
                session.apply(StreamEvent::Content(piece.to_string()), persisted_len),
                Flow::Continue
            );
        }
        assert_eq!(session.apply(StreamEvent::Done, persisted_len), Flow::Finished);
    }

    #[test]
    fn concatenates_tokens_in_order_on_settle() {
        let mut session = ChatSession::new();
        session.begin_send("What is virtue?", 0).unwrap();
        assert_eq!(session.phase(), TurnPhase::Streaming);
        stream(&mut session, &["Virtue ", "is", "..."], 0);
        assert_eq!(session.phase(), TurnPhase::StreamSettled);
        assert!(!session.is_streaming());
        assert_eq!(session.pending_assistant_text(), Some("Virtue is..."));
        assert_eq!(session.streaming_text(), None);
    }

    #[test]
    fn full_turn_never_duplicates_the_answer() {
        let mut session = ChatSession::new();
        session.begin_send("What is virtue?", 0).unwrap();
        stream(&mut session, &["Virtue ", "is..."], 0);

        let list = vec![
            persisted("u1", Role::User, "What is virtue?"),
            persisted("a1", Role::Assistant, "Virtue is..."),
        ];
        let outcome = session.reconcile(&list);
        assert!(outcome.user_retired && outcome.assistant_retired);
        assert_eq!(session.phase(), TurnPhase::Idle);

        let rendered = session.render(&list);
        let copies = rendered
            .iter()
            .filter(|m| m.message.content == "Virtue is...")
            .count();
        assert_eq!(copies, 1);
        assert!(rendered.iter().all(|m| !m.message.is_transient()));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut session = ChatSession::new();
        session.begin_send("Q", 0).unwrap();
        stream(&mut session, &["A"], 0);
        let list = vec![
            persisted("u1", Role::User, "Q"),
            persisted("a1", Role::Assistant, "A"),
        ];
        let first = session.reconcile(&list);
        let after_first = session.clone();
        let second = session.reconcile(&list);
        assert!(first.any());
        assert_eq!(second, Reconciliation::default());
        assert_eq!(session.user_track(), after_first.user_track());
        assert_eq!(session.assistant_track(), after_first.assistant_track());

        // Nothing pending at all is fine too.
        let mut idle = ChatSession::new();
        assert_eq!(idle.reconcile(&[]), Reconciliation::default());
    }

    #[test]
    fn unchanged_length_never_retires() {
        let mut session = ChatSession::new();
        let list = vec![persisted("a0", Role::Assistant, "A")];
        session.begin_send("Q", 1).unwrap();
        stream(&mut session, &["A"], 1);
        assert_eq!(session.reconcile(&list), Reconciliation::default());
        assert_eq!(session.pending_assistant_text(), Some("A"));
        assert_eq!(session.pending_user_text(), Some("Q"));
    }

    #[test]
    fn user_track_can_reconcile_before_stream_ends() {
        let mut session = ChatSession::new();
        session.begin_send("Q", 0).unwrap();
        session.apply(StreamEvent::Content("par".into()), 0);
        let outcome = session.reconcile(&[persisted("u1", Role::User, "Q")]);
        assert!(outcome.user_retired);
        assert!(!outcome.assistant_retired);
        assert!(session.is_streaming());
        assert_eq!(session.streaming_text(), Some("par"));
    }

    #[test]
    fn failure_leaves_a_clean_slate() {
        let mut session = ChatSession::new();
        session.begin_send("Q", 3).unwrap();
        for piece in ["a", "b", "c"] {
            session.apply(StreamEvent::Content(piece.into()), 3);
        }
        session.fail();
        assert_eq!(session.phase(), TurnPhase::Idle);
        assert!(!session.is_streaming());
        assert_eq!(session.user_track(), &UserTrack::Idle);
        assert_eq!(session.assistant_track(), &AssistantTrack::Idle);
        assert!(session.render(&[]).is_empty());
    }

    #[test]
    fn second_send_while_streaming_is_refused() {
        let mut session = ChatSession::new();
        session.begin_send("first", 0).unwrap();
        assert_eq!(
            session.begin_send("second", 0),
            Err(SessionError::AlreadyStreaming)
        );
        assert_eq!(session.pending_user_text(), Some("first"));
        assert_eq!(session.begin_send("  ", 0), Err(SessionError::AlreadyStreaming));
        session.fail();
        assert_eq!(session.begin_send("  ", 0), Err(SessionError::EmptyMessage));
    }

    #[test]
    fn standard_mode_ignores_audit_events() {
        let mut session = ChatSession::new();
        assert_eq!(session.begin_send("Q", 0).unwrap(), ChatMode::Standard);
        session.apply(StreamEvent::Trace(TraceEvent::new(TraceKind::Query)), 0);
        session.apply(StreamEvent::AuditReport("report".into()), 0);
        stream(&mut session, &["A"], 0);
        assert!(session.audit().events.is_empty());
        assert_eq!(session.audit().report, None);
        assert_eq!(session.pending_assistant_text(), Some("A"));
    }

    #[test]
    fn audit_mode_collects_trace_and_replaces_report() {
        let mut session = ChatSession::new().with_audit_mode(true);
        assert_eq!(session.begin_send("Q", 0).unwrap(), ChatMode::Audited);
        session.apply(StreamEvent::Trace(TraceEvent::new(TraceKind::SearchStart)), 0);
        session.apply(StreamEvent::Trace(TraceEvent::new(TraceKind::PassageFound)), 0);
        session.apply(StreamEvent::AuditReport("first".into()), 0);
        session.apply(StreamEvent::AuditReport("second".into()), 0);
        stream(&mut session, &["A"], 0);
        let kinds: Vec<TraceKind> = session.audit().events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TraceKind::SearchStart, TraceKind::PassageFound]);
        assert_eq!(session.audit().report.as_deref(), Some("second"));
        assert_eq!(session.pending_assistant_text(), Some("A"));

        // A new send starts a fresh audit log.
        session.begin_send("Q2", 2).unwrap();
        assert!(session.audit().events.is_empty());
        assert_eq!(session.audit().report, None);
    }

    #[test]
    fn render_appends_synthetic_bubbles_after_persisted() {
        let list = vec![persisted("u0", Role::User, "earlier")];
        let mut session = ChatSession::new();
        session.begin_send("Q", 1).unwrap();
        session.apply(StreamEvent::Content("partial".into()), 1);

        let rendered = session.render(&list);
        let ids: Vec<&str> = rendered.iter().map(|m| m.message.id.as_str()).collect();
        assert_eq!(ids, vec!["u0", PENDING_USER_ID, STREAMING_ID]);
        assert!(rendered[2].streaming);
        assert_eq!(rendered[1].message.conversation_id, "");

        session.apply(StreamEvent::Done, 1);
        let rendered = session.render(&list);
        assert_eq!(rendered.last().unwrap().message.id, PENDING_ID);
        assert!(!rendered.last().unwrap().streaming);
    }

    #[test]
    fn empty_stream_settles_to_idle() {
        let mut session = ChatSession::new();
        session.begin_send("Q", 0).unwrap();
        session.apply(StreamEvent::Done, 0);
        assert_eq!(session.assistant_track(), &AssistantTrack::Idle);
        assert_eq!(session.phase(), TurnPhase::UserPending);
    }

    #[test]
    fn assistant_baseline_is_taken_at_stream_end() {
        let mut session = ChatSession::new();
        session.begin_send("Q", 0).unwrap();
        session.apply(StreamEvent::Content("A".into()), 0);
        // A refetch during streaming grew the cache to 2.
        session.apply(StreamEvent::Done, 2);
        match session.assistant_track() {
            AssistantTrack::Settled { baseline, .. } => assert_eq!(*baseline, 2),
            other => panic!("expected settled, got {other:?}"),
        }
    }

    #[test]
    fn switching_conversation_resets_everything() {
        let mut session = ChatSession::new().with_audit_mode(true);
        session.begin_send("Q", 0).unwrap();
        session.apply(StreamEvent::Trace(TraceEvent::new(TraceKind::Query)), 0);
        session.apply(StreamEvent::Content("A".into()), 0);
        session.apply(StreamEvent::Done, 0);
        session.reset_for_conversation();
        assert_eq!(session.phase(), TurnPhase::Idle);
        assert!(session.audit().events.is_empty());
    }
}
