//! Audit trace events describing server-side retrieval and generation steps.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::StreamEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Query,
    SearchStart,
    PassageFound,
    PassageRejected,
    DirectAnswer,
    AlignmentCheck,
    GenerationStart,
    Complete,
    Error,
}

impl TraceKind {
    pub fn label(&self) -> &'static str {
        match self {
            TraceKind::Query => "QUERY",
            TraceKind::SearchStart => "SEARCH_START",
            TraceKind::PassageFound => "PASSAGE_FOUND",
            TraceKind::PassageRejected => "PASSAGE_REJECTED",
            TraceKind::DirectAnswer => "DIRECT_ANSWER",
            TraceKind::AlignmentCheck => "ALIGNMENT_CHECK",
            TraceKind::GenerationStart => "GENERATION_START",
            TraceKind::Complete => "COMPLETE",
            TraceKind::Error => "ERROR",
        }
    }
}

/// Corpus table a passage came from, searched in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTable {
    Positions,
    Quotes,
    Chunks,
}

impl SourceTable {
    pub const SEARCH_ORDER: [SourceTable; 3] =
        [SourceTable::Positions, SourceTable::Quotes, SourceTable::Chunks];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTable::Positions => "positions",
            SourceTable::Quotes => "quotes",
            SourceTable::Chunks => "chunks",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    /// Unix milliseconds.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<SourceTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passage_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_number: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aligned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicting: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TraceEvent {
    /// New event with timestamp 0; the recorder stamps it on emit.
    pub fn new(kind: TraceKind) -> Self {
        Self {
            timestamp: 0,
            kind,
            table: None,
            sql: None,
            passage: None,
            passage_id: None,
            reason: None,
            answer_number: None,
            aligned: None,
            conflicting: None,
            message: None,
        }
    }

    pub fn with_table(mut self, table: SourceTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_passage(mut self, id: u64, text: impl Into<String>) -> Self {
        self.passage_id = Some(id);
        self.passage = Some(text.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Direct answers are numbered 1 to 3; anything else is dropped.
    pub fn with_answer_number(mut self, number: u8) -> Self {
        self.answer_number = (1..=3).contains(&number).then_some(number);
        self
    }

    pub fn with_alignment(mut self, aligned: bool, conflicting: bool) -> Self {
        self.aligned = Some(aligned);
        self.conflicting = Some(conflicting);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

fn unix_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or_default()
}

/// Collects the trace of one request and forwards each event as it happens.
///
/// A disabled recorder swallows everything, which is how standard mode keeps
/// trace events off the wire entirely.
pub struct TraceRecorder {
    enabled: bool,
    sink: Option<mpsc::Sender<StreamEvent>>,
    last_timestamp: u64,
    events: Vec<TraceEvent>,
}

impl TraceRecorder {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            sink: None,
            last_timestamp: 0,
            events: Vec::new(),
        }
    }

    /// Record without forwarding anywhere.
    pub fn collecting() -> Self {
        Self {
            enabled: true,
            ..Self::disabled()
        }
    }

    pub fn streaming(sink: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            enabled: true,
            sink: Some(sink),
            ..Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn emit(&mut self, mut event: TraceEvent) {
        if !self.enabled {
            return;
        }
        // Wall clock may step backwards; the trace must not.
        self.last_timestamp = self.last_timestamp.max(unix_millis());
        event.timestamp = self.last_timestamp;
        self.events.push(event.clone());
        if let Some(sink) = &self.sink
            && sink.send(StreamEvent::Trace(event)).await.is_err()
        {
            tracing::debug!("trace receiver dropped; continuing without forwarding");
            self.sink = None;
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}
