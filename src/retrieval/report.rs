use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

use super::RetrievalOutcome;
use crate::trace::TraceEvent;

fn rule(ch: char) -> String {
    ch.to_string().repeat(60)
}

fn clock(millis: u64) -> String {
    let nanos = i128::from(millis) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|t| {
            t.format(format_description!("[hour]:[minute]:[second].[subsecond digits:3]"))
                .ok()
        })
        .unwrap_or_else(|| millis.to_string())
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Plain-text report of one audited search, streamed after the answer.
pub fn audit_report(outcome: &RetrievalOutcome, trace: &[TraceEvent]) -> String {
    let mut lines = vec![
        rule('='),
        "AUDIT REPORT: CORPUS SEARCH TRACE".to_string(),
        rule('='),
        String::new(),
        format!("Question: {}", outcome.question),
        format!("Thinker: {}", outcome.persona),
        format!(
            "Timestamp: {}",
            outcome
                .searched_at
                .format(&Rfc3339)
                .unwrap_or_default()
        ),
        format!("Final Decision: {}", outcome.decision().as_str().to_uppercase()),
        String::new(),
        rule('-'),
        "EXECUTION TRACE".to_string(),
        rule('-'),
    ];

    for event in trace {
        let mut line = format!("[{}] {}", clock(event.timestamp), event.kind.label());
        if let Some(table) = event.table {
            line.push_str(&format!(" ({})", table.as_str()));
        }
        if let Some(message) = &event.message {
            line.push_str(&format!(": {message}"));
        }
        if let Some(sql) = &event.sql {
            line.push_str(&format!("\n    SQL: {}", shorten(sql, 100)));
        }
        if let Some(passage) = &event.passage {
            line.push_str(&format!("\n    Passage: \"{passage}\""));
        }
        if let Some(reason) = &event.reason {
            line.push_str(&format!("\n    Reason: {reason}"));
        }
        if let Some(number) = event.answer_number {
            line.push_str(&format!("\n    -> Direct Answer #{number}"));
        }
        lines.push(line);
    }

    lines.extend([String::new(), rule('-'), "DIRECT ANSWERS FOUND".to_string(), rule('-')]);
    if outcome.direct_answers.is_empty() {
        lines.push("No direct answers found in corpus.".to_string());
    }
    for (i, answer) in outcome.direct_answers.iter().enumerate() {
        lines.push(format!("\nDirect Answer #{}:", i + 1));
        lines.push(format!("  Source: {} (ID: {})", answer.source.as_str(), answer.source_id));
        lines.push(format!("  Topic: {}", answer.topic.as_deref().unwrap_or("N/A")));
        lines.push(format!("  Relevance Score: {:.1}%", answer.relevance * 100.0));
        lines.push(format!("  Text: \"{}\"", shorten(&answer.text, 500)));
    }

    lines.extend([
        String::new(),
        rule('-'),
        "ALIGNMENT ANALYSIS".to_string(),
        rule('-'),
        format!("Answers Aligned: {}", if outcome.aligned { "YES" } else { "NO" }),
        format!(
            "Contradictions Detected: {}",
            if outcome.conflicting { "YES" } else { "NO" }
        ),
    ]);

    if !outcome.adjacent.is_empty() {
        lines.extend([
            String::new(),
            rule('-'),
            "ADJACENT MATERIAL (used if no direct answer)".to_string(),
            rule('-'),
        ]);
        for (i, passage) in outcome.adjacent.iter().enumerate() {
            lines.push(format!("\n[{}] {}", i + 1, shorten(passage, 300)));
        }
    }

    lines.extend([String::new(), rule('='), "END OF AUDIT REPORT".to_string(), rule('=')]);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::DirectAnswer;
    use crate::trace::{SourceTable, TraceKind};

    #[test]
    fn report_lists_trace_and_answers() {
        let mut outcome = RetrievalOutcome::empty("What is virtue?", "Plato");
        outcome.direct_answers.push(DirectAnswer {
            text: "Virtue is knowledge.".into(),
            source: SourceTable::Positions,
            source_id: 4,
            topic: Some("ethics".into()),
            relevance: 0.75,
        });
        let mut event = TraceEvent::new(TraceKind::DirectAnswer)
            .with_table(SourceTable::Positions)
            .with_answer_number(1);
        event.timestamp = 1_000;

        let report = audit_report(&outcome, &[event]);
        assert!(report.starts_with(&"=".repeat(60)));
        assert!(report.contains("Final Decision: ALIGNED"));
        assert!(report.contains("[00:00:01.000] DIRECT_ANSWER (positions)"));
        assert!(report.contains("-> Direct Answer #1"));
        assert!(report.contains("Source: positions (ID: 4)"));
        assert!(report.contains("Relevance Score: 75.0%"));
        assert!(report.ends_with(&format!("END OF AUDIT REPORT\n{}", "=".repeat(60))));
    }

    #[test]
    fn empty_search_says_so() {
        let outcome = RetrievalOutcome::empty("q", "Kant");
        let report = audit_report(&outcome, &[]);
        assert!(report.contains("No direct answers found in corpus."));
        assert!(report.contains("Final Decision: NO_DIRECT_ANSWER"));
        assert!(!report.contains("ADJACENT MATERIAL"));
    }
}
