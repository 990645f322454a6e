use serde::{Deserialize, Serialize};

use crate::trace::TraceEvent;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One decoded event of a chat response.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Next piece of assistant text.
    Content(String),
    /// Audit-mode reasoning step. Never part of the assistant text.
    Trace(TraceEvent),
    /// Full audit report; replaces any earlier one.
    AuditReport(String),
    Done,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Payload {
    Content {
        content: String,
    },
    Trace {
        trace: TraceEvent,
    },
    AuditReport {
        #[serde(rename = "auditReport")]
        audit_report: String,
    },
}

impl StreamEvent {
    /// The text following `data: ` for this event.
    pub fn data(&self) -> Result<String, CodecError> {
        let payload = match self {
            StreamEvent::Done => return Ok(DONE_MARKER.to_string()),
            StreamEvent::Content(content) => Payload::Content {
                content: content.clone(),
            },
            StreamEvent::Trace(trace) => Payload::Trace {
                trace: trace.clone(),
            },
            StreamEvent::AuditReport(report) => Payload::AuditReport {
                audit_report: report.clone(),
            },
        };
        Ok(serde_json::to_string(&payload)?)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done)
    }
}

/// Full framed event, terminated by the blank line SSE expects.
pub fn encode_line(event: &StreamEvent) -> Result<String, CodecError> {
    Ok(format!("{DATA_PREFIX}{}\n\n", event.data()?))
}

/// Decode one complete line.
///
/// Lines without the data prefix (blank separators, SSE comments) yield
/// `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<StreamEvent>, CodecError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    if data == DONE_MARKER {
        return Ok(Some(StreamEvent::Done));
    }
    let event = match serde_json::from_str::<Payload>(data)? {
        Payload::Content { content } => StreamEvent::Content(content),
        Payload::Trace { trace } => StreamEvent::Trace(trace),
        Payload::AuditReport { audit_report } => StreamEvent::AuditReport(audit_report),
    };
    Ok(Some(event))
}

/// Carry-over buffer between network chunks.
///
/// Works on raw bytes and only releases `\n`-terminated lines, so neither a
/// partial line nor a multi-byte character split across chunks is ever
/// decoded early.
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.carry[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_bytes(&self.carry[start..end]));
            start = end + 1;
        }
        self.carry.drain(..start);
        lines
    }

    /// Whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = decode_bytes(&self.carry);
        self.carry.clear();
        Some(rest)
    }

    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }
}

fn decode_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SourceTable, TraceKind};

    #[test]
    fn decodes_each_payload_kind() {
        assert_eq!(
            decode_line(r#"data: {"content":"Virtue "}"#).unwrap(),
            Some(StreamEvent::Content("Virtue ".into()))
        );
        assert_eq!(
            decode_line(r#"data: {"auditReport":"REPORT"}"#).unwrap(),
            Some(StreamEvent::AuditReport("REPORT".into()))
        );
        assert_eq!(
            decode_line("data: [DONE]").unwrap(),
            Some(StreamEvent::Done)
        );

        let trace = decode_line(
            r#"data: {"trace":{"timestamp":12,"type":"search_start","table":"positions"}}"#,
        )
        .unwrap();
        match trace {
            Some(StreamEvent::Trace(event)) => {
                assert_eq!(event.kind, TraceKind::SearchStart);
                assert_eq!(event.table, Some(SourceTable::Positions));
                assert_eq!(event.timestamp, 12);
            }
            other => panic!("expected trace, got {other:?}"),
        }
    }

    #[test]
    fn ignores_lines_without_prefix() {
        assert_eq!(decode_line("").unwrap(), None);
        assert_eq!(decode_line(": keep-alive").unwrap(), None);
        assert_eq!(decode_line("event: message").unwrap(), None);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(decode_line("data: {not json").is_err());
        assert!(decode_line(r#"data: {"error":"boom"}"#).is_err());
        assert!(decode_line(r#"data: {"content":5}"#).is_err());
    }

    #[test]
    fn strips_carriage_return() {
        assert_eq!(
            decode_line("data: [DONE]\r").unwrap(),
            Some(StreamEvent::Done)
        );
    }

    #[test]
    fn encodes_framed_lines() {
        assert_eq!(
            encode_line(&StreamEvent::Content("a\"b".into())).unwrap(),
            "data: {\"content\":\"a\\\"b\"}\n\n"
        );
        assert_eq!(encode_line(&StreamEvent::Done).unwrap(), "data: [DONE]\n\n");
        assert_eq!(
            StreamEvent::AuditReport("r".into()).data().unwrap(),
            r#"{"auditReport":"r"}"#
        );
    }

    #[test]
    fn line_buffer_holds_back_partial_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"con").is_empty());
        assert_eq!(buffer.pending_bytes(), 11);
        let lines = buffer.push(b"tent\":\"hi\"}\n\ndata: [DO");
        assert_eq!(lines, vec![r#"data: {"content":"hi"}"#.to_string(), String::new()]);
        assert_eq!(buffer.push(b"NE]\n"), vec!["data: [DONE]".to_string()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn line_buffer_survives_split_multibyte_characters() {
        let line = "data: {\"content\":\"Ἀρετή\"}\n".as_bytes();
        // Split inside the first Greek character.
        let split = line.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(&line[..split]).is_empty());
        let lines = buffer.push(&line[split..]);
        assert_eq!(
            decode_line(&lines[0]).unwrap(),
            Some(StreamEvent::Content("Ἀρετή".into()))
        );
    }

    #[test]
    fn line_buffer_returns_unterminated_remainder() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: [DONE]").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(buffer.finish(), None);
    }
}
