use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{DirectAnswer, MAX_ADJACENT, MAX_DIRECT_ANSWERS, RetrievalOutcome, Retriever};
use crate::persona::Persona;
use crate::trace::{SourceTable, TraceEvent, TraceKind, TraceRecorder};

const STOP_WORDS: &[&str] = &[
    "what", "when", "where", "which", "that", "this", "have", "does", "would", "could", "should",
    "about", "think", "your", "with", "from", "they", "their", "there", "been", "being", "were",
    "will",
];

/// Pairs of phrases that signal two passages disagree.
const CONTRADICTIONS: &[(&str, &str)] = &[
    ("is", "is not"),
    ("exists", "does not exist"),
    ("true", "false"),
    ("good", "bad"),
    ("possible", "impossible"),
    ("necessary", "unnecessary"),
    ("always", "never"),
    ("all", "none"),
    ("should", "should not"),
    ("must", "must not"),
];

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Passage {
    #[serde(default)]
    pub id: u64,
    pub table: SourceTable,
    pub text: String,
    #[serde(default)]
    pub topic: Option<String>,
}

/// How well a passage answers a question.
#[derive(Clone, Debug, PartialEq)]
pub struct Relevance {
    pub direct: bool,
    pub score: f64,
    pub reason: String,
}

fn keywords(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .split_whitespace()
        .filter(|w| w.chars().count() > 3 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Keyword overlap between a passage and a question.
///
/// Half the key terms in a passage of 50+ characters is a direct answer, as
/// is a third of them in a passage of 100+ characters (at a discount).
pub fn relevance(passage: &str, question: &str) -> Relevance {
    let terms = keywords(question);
    if terms.is_empty() {
        return Relevance {
            direct: false,
            score: 0.0,
            reason: "question has no searchable keywords".into(),
        };
    }

    let haystack = passage.to_lowercase();
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    let ratio = matched as f64 / terms.len() as f64;
    let length = passage.chars().count();

    if ratio >= 0.5 && length >= 50 {
        Relevance {
            direct: true,
            score: ratio,
            reason: format!("matches {matched}/{} key terms", terms.len()),
        }
    } else if ratio >= 0.3 && length >= 100 {
        Relevance {
            direct: true,
            score: ratio * 0.8,
            reason: format!("partial match: {matched}/{} key terms", terms.len()),
        }
    } else {
        Relevance {
            direct: false,
            score: ratio,
            reason: format!("only {matched}/{} key terms match", terms.len()),
        }
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_phrase(words: &[String], phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split(' ').collect();
    words
        .windows(needle.len())
        .any(|window| window.iter().zip(&needle).all(|(w, n)| w == n))
}

/// True when any two answers use opposite phrases from the contradiction table.
pub(crate) fn conflicting(answers: &[DirectAnswer]) -> bool {
    let texts: Vec<Vec<String>> = answers.iter().map(|a| words(&a.text)).collect();
    for (i, left) in texts.iter().enumerate() {
        for right in &texts[i + 1..] {
            for (a, b) in CONTRADICTIONS {
                if (has_phrase(left, a) && has_phrase(right, b))
                    || (has_phrase(left, b) && has_phrase(right, a))
                {
                    return true;
                }
            }
        }
    }
    false
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn scan_limit(table: SourceTable) -> usize {
    match table {
        SourceTable::Positions | SourceTable::Quotes => 20,
        SourceTable::Chunks => 30,
    }
}

/// Keyword retriever over `<dir>/<persona id>.json` corpus files.
pub struct CorpusRetriever {
    dir: Option<PathBuf>,
    loaded: RwLock<HashMap<String, Arc<Vec<Passage>>>>,
}

impl CorpusRetriever {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// Fixed corpora keyed by persona id, without any files.
    pub fn from_passages(corpora: HashMap<String, Vec<Passage>>) -> Self {
        let loaded = corpora
            .into_iter()
            .map(|(id, passages)| (id, Arc::new(number(passages))))
            .collect();
        Self {
            dir: None,
            loaded: RwLock::new(loaded),
        }
    }

    async fn corpus(&self, persona_id: &str) -> Result<Arc<Vec<Passage>>, String> {
        if let Some(found) = self.loaded.read().await.get(persona_id) {
            return Ok(found.clone());
        }
        let Some(dir) = &self.dir else {
            return Ok(Arc::new(Vec::new()));
        };

        let path = dir.join(format!("{persona_id}.json"));
        let passages = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let parsed: Vec<Passage> = serde_json::from_slice(&bytes)
                    .map_err(|e| format!("corpus {} is invalid: {e}", path.display()))?;
                number(parsed)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no corpus file for persona");
                Vec::new()
            }
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };

        let passages = Arc::new(passages);
        self.loaded
            .write()
            .await
            .insert(persona_id.to_string(), passages.clone());
        Ok(passages)
    }
}

/// Ids are 1-based positions in the file unless the file sets them.
fn number(mut passages: Vec<Passage>) -> Vec<Passage> {
    for (i, passage) in passages.iter_mut().enumerate() {
        if passage.id == 0 {
            passage.id = i as u64 + 1;
        }
    }
    passages
}

fn search_message(table: SourceTable) -> &'static str {
    match table {
        SourceTable::Positions => "searching positions first (highest signal)",
        SourceTable::Quotes => "searching quotes (need more direct answers)",
        SourceTable::Chunks => "searching chunks (full works, last resort)",
    }
}

#[async_trait]
impl Retriever for CorpusRetriever {
    async fn retrieve(&self, question: &str, persona: &Persona, recorder: &mut TraceRecorder) -> RetrievalOutcome {
        let mut outcome = RetrievalOutcome::empty(question, &persona.name);
        recorder
            .emit(TraceEvent::new(TraceKind::Query).with_message(format!("searching corpus for: \"{question}\"")))
            .await;

        let corpus = match self.corpus(&persona.id).await {
            Ok(corpus) => corpus,
            Err(message) => {
                tracing::warn!(persona = %persona.id, "{message}");
                recorder
                    .emit(TraceEvent::new(TraceKind::Error).with_message(message))
                    .await;
                Arc::new(Vec::new())
            }
        };

        for table in SourceTable::SEARCH_ORDER {
            if outcome.direct_answers.len() >= MAX_DIRECT_ANSWERS {
                break;
            }
            let limit = scan_limit(table);
            recorder
                .emit(
                    TraceEvent::new(TraceKind::SearchStart)
                        .with_table(table)
                        .with_message(search_message(table)),
                )
                .await;
            recorder
                .emit(TraceEvent::new(TraceKind::Query).with_table(table).with_sql(format!(
                    "SELECT id, text, topic FROM {} WHERE thinker = '{}' ORDER BY relevance DESC LIMIT {limit}",
                    table.as_str(),
                    persona.id
                )))
                .await;

            let mut candidates: Vec<(&Passage, Relevance)> = corpus
                .iter()
                .filter(|p| p.table == table)
                .map(|p| (p, relevance(&p.text, question)))
                .collect();
            candidates.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));

            for (passage, rel) in candidates.into_iter().take(limit) {
                if rel.direct {
                    let number = outcome.direct_answers.len() + 1;
                    recorder
                        .emit(
                            TraceEvent::new(TraceKind::DirectAnswer)
                                .with_table(table)
                                .with_passage(passage.id, excerpt(&passage.text, 200))
                                .with_answer_number(number as u8)
                                .with_reason(rel.reason),
                        )
                        .await;
                    outcome.direct_answers.push(DirectAnswer {
                        text: passage.text.clone(),
                        source: table,
                        source_id: passage.id,
                        topic: passage.topic.clone(),
                        relevance: rel.score,
                    });
                    if outcome.direct_answers.len() >= MAX_DIRECT_ANSWERS {
                        break;
                    }
                } else if rel.score > 0.1 {
                    recorder
                        .emit(
                            TraceEvent::new(TraceKind::PassageFound)
                                .with_table(table)
                                .with_passage(passage.id, excerpt(&passage.text, 100))
                                .with_reason(format!("adjacent material, {}", rel.reason)),
                        )
                        .await;
                    outcome.adjacent.push(passage.text.clone());
                } else {
                    recorder
                        .emit(
                            TraceEvent::new(TraceKind::PassageRejected)
                                .with_table(table)
                                .with_passage(passage.id, excerpt(&passage.text, 100))
                                .with_reason(rel.reason),
                        )
                        .await;
                }
            }
        }

        outcome.adjacent.truncate(MAX_ADJACENT);
        outcome.conflicting = outcome.direct_answers.len() >= 2 && conflicting(&outcome.direct_answers);
        outcome.aligned = !outcome.conflicting;

        let found = outcome.direct_answers.len();
        let message = if found >= MAX_DIRECT_ANSWERS && outcome.conflicting {
            format!("found {found} answers but they conflict; presenting them separately")
        } else if found >= MAX_DIRECT_ANSWERS {
            format!("found {found} aligned answers")
        } else {
            format!("only {found} direct answer(s); using adjacent material")
        };
        recorder
            .emit(
                TraceEvent::new(TraceKind::AlignmentCheck)
                    .with_alignment(outcome.aligned, outcome.conflicting)
                    .with_message(message),
            )
            .await;
        recorder
            .emit(TraceEvent::new(TraceKind::Complete).with_message(format!(
                "search complete: {}; {found} direct answer(s), {} adjacent passage(s)",
                outcome.decision().as_str(),
                outcome.adjacent.len()
            )))
            .await;

        tracing::debug!(
            persona = %persona.id,
            direct = found,
            adjacent = outcome.adjacent.len(),
            "corpus search finished"
        );
        outcome
    }
}
