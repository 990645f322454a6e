/// Corpus retrieval that narrates its own search.
///
/// - `corpus` - keyword search over a persona's positions, quotes and chunks
/// - `report` - plain-text audit report of one search
mod corpus;
mod report;

pub use corpus::{CorpusRetriever, Passage, relevance};
pub use report::audit_report;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::persona::Persona;
use crate::trace::{SourceTable, TraceRecorder};

/// Direct answers needed before the search stops.
pub const MAX_DIRECT_ANSWERS: usize = 3;
/// Adjacent passages handed to the model when no direct answer exists.
pub const MAX_ADJACENT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Aligned,
    Conflicting,
    NoDirectAnswer,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Aligned => "aligned",
            Decision::Conflicting => "conflicting",
            Decision::NoDirectAnswer => "no_direct_answer",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirectAnswer {
    pub text: String,
    pub source: SourceTable,
    pub source_id: u64,
    pub topic: Option<String>,
    pub relevance: f64,
}

/// Everything one search found, in the order it was found.
#[derive(Clone, Debug)]
pub struct RetrievalOutcome {
    pub question: String,
    pub persona: String,
    pub searched_at: OffsetDateTime,
    pub direct_answers: Vec<DirectAnswer>,
    pub aligned: bool,
    pub conflicting: bool,
    pub adjacent: Vec<String>,
}

impl RetrievalOutcome {
    pub fn empty(question: &str, persona: &str) -> Self {
        Self {
            question: question.to_string(),
            persona: persona.to_string(),
            searched_at: OffsetDateTime::now_utc(),
            direct_answers: Vec::new(),
            aligned: true,
            conflicting: false,
            adjacent: Vec::new(),
        }
    }

    pub fn decision(&self) -> Decision {
        if self.conflicting {
            Decision::Conflicting
        } else if self.direct_answers.is_empty() {
            Decision::NoDirectAnswer
        } else {
            Decision::Aligned
        }
    }

    /// Retrieved material formatted for the system prompt. Empty when nothing was found.
    pub fn context_block(&self) -> String {
        let name = self.persona.to_uppercase();
        if !self.direct_answers.is_empty() {
            let mut block = format!("=== DIRECT ANSWERS FROM {name}'S CORPUS ===\n\n");
            for (i, answer) in self.direct_answers.iter().enumerate() {
                block.push_str(&format!(
                    "[Answer {} from {}]:\n\"{}\"\n\n",
                    i + 1,
                    answer.source.as_str(),
                    answer.text
                ));
            }
            block.push_str("=== END DIRECT ANSWERS ===");
            return block;
        }
        if !self.adjacent.is_empty() {
            let mut block = String::from("=== ADJACENT MATERIAL (no direct answers found) ===\n\n");
            for passage in &self.adjacent {
                block.push_str(passage);
                block.push_str("\n\n");
            }
            block.push_str("=== END ADJACENT MATERIAL ===");
            return block;
        }
        String::new()
    }

    /// How the persona should use the material, depending on the decision.
    pub fn instructions(&self) -> String {
        let context = self.context_block();
        match self.decision() {
            Decision::Conflicting => format!(
                "The corpus search found answers that CONFLICT with each other.\n\
                 Present each answer separately as a numbered section. Do not \
                 reconcile or smooth over the disagreement.\n\n{context}"
            ),
            Decision::NoDirectAnswer if context.is_empty() => String::from(
                "The corpus search found nothing on this question. Say that your \
                 writings do not address it before offering anything else.",
            ),
            Decision::NoDirectAnswer => format!(
                "The corpus search did NOT find a direct answer. Use the adjacent \
                 material below cautiously and label the response as indirect.\n\n{context}"
            ),
            Decision::Aligned => format!(
                "The corpus search found {} aligned direct answer(s). Ground the \
                 response in them and quote them where it helps.\n\n{context}",
                self.direct_answers.len()
            ),
        }
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Search for material answering `question`, narrating each step to `recorder`.
    async fn retrieve(&self, question: &str, persona: &Persona, recorder: &mut TraceRecorder) -> RetrievalOutcome;
}
