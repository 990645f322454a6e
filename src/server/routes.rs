use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use time::macros::format_description;
use tokio::sync::mpsc;

use super::AppState;
use super::error::ApiError;
use super::identity::SessionIdentity;
use crate::persona::PersonaSummary;
use crate::stream::StreamEvent;
use crate::types::{ChatMode, ChatRequest, Conversation, ConversationSummary, Message, Role};

const TITLE_CHARS: usize = 50;
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    conversation_id: Option<String>,
}

pub async fn chat_stream(
    State(state): State<AppState>,
    session: SessionIdentity,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let rx = state
        .orchestrator
        .start_turn(session.as_str(), request, ChatMode::Standard)
        .await?;
    Ok(event_stream(rx))
}

pub async fn chat_stream_audited(
    State(state): State<AppState>,
    session: SessionIdentity,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let rx = state
        .orchestrator
        .start_turn(session.as_str(), request, ChatMode::Audited)
        .await?;
    Ok(event_stream(rx))
}

/// One `data:` frame per event; the stream ends after the end marker.
fn event_stream(rx: mpsc::Receiver<StreamEvent>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            let event = rx.recv().await?;
            match event.data() {
                Ok(data) => return Some((Ok(Event::default().data(data)), rx)),
                Err(err) => tracing::warn!(error = %err, "dropping unencodable event"),
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn owned_conversation(state: &AppState, session: &SessionIdentity, id: &str) -> Result<Conversation, ApiError> {
    let conversation = state
        .repo
        .get_conversation(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Chat not found".into()))?;
    if conversation.session_id != session.as_str() {
        return Err(ApiError::Forbidden("Access denied".into()));
    }
    Ok(conversation)
}

pub async fn list_messages(
    State(state): State<AppState>,
    session: SessionIdentity,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let conversation = match query.conversation_id {
        Some(id) => owned_conversation(&state, &session, &id).await?,
        None => match state.repo.current_conversation(session.as_str()).await? {
            Some(conversation) => conversation,
            None => state.repo.create_conversation(session.as_str(), None).await?,
        },
    };
    Ok(Json(state.repo.list_messages(&conversation.id).await?))
}

pub async fn delete_message(
    State(state): State<AppState>,
    session: SessionIdentity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.repo.delete_message(session.as_str(), &id).await? {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(ApiError::NotFound("Message not found".into()))
    }
}

pub async fn new_conversation(
    State(state): State<AppState>,
    session: SessionIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversation = state.repo.create_conversation(session.as_str(), None).await?;
    tracing::info!(conversation = %conversation.id, "new conversation");
    Ok(Json(json!({ "conversation": conversation })))
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub fn summarize(conversation: &Conversation, messages: &[Message]) -> ConversationSummary {
    let first_user = messages.iter().find(|m| m.role == Role::User);
    let title = match (&conversation.title, first_user) {
        (Some(title), _) if !title.trim().is_empty() => title.clone(),
        (_, Some(message)) => format!("{}...", truncate(&message.content, TITLE_CHARS)),
        _ => "Untitled".to_string(),
    };
    ConversationSummary {
        id: conversation.id.clone(),
        title,
        message_count: messages.len(),
        preview: first_user
            .map(|m| truncate(&m.content, PREVIEW_CHARS))
            .unwrap_or_default(),
        created_at: conversation.created_at,
    }
}

pub async fn chat_history(
    State(state): State<AppState>,
    session: SessionIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conversations = Vec::new();
    for conversation in state.repo.list_conversations(session.as_str()).await? {
        let messages = state.repo.list_messages(&conversation.id).await?;
        if !messages.is_empty() {
            conversations.push(summarize(&conversation, &messages));
        }
    }
    Ok(Json(json!({ "conversations": conversations })))
}

pub async fn get_chat(
    State(state): State<AppState>,
    session: SessionIdentity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversation = owned_conversation(&state, &session, &id).await?;
    let messages = state.repo.list_messages(&conversation.id).await?;
    Ok(Json(json!({ "conversation": conversation, "messages": messages })))
}

/// Plain-text transcript of a conversation.
pub fn transcript(conversation: &Conversation, messages: &[Message]) -> String {
    let date = conversation
        .created_at
        .format(format_description!("[year]-[month]-[day] [hour]:[minute] UTC"))
        .unwrap_or_default();
    let mut out = format!(
        "# {}\n# Date: {date}\n{}\n\n",
        conversation.title.as_deref().unwrap_or("Philosophical Conversation"),
        "=".repeat(60)
    );
    for message in messages {
        let speaker = match message.role {
            Role::User => "YOU",
            Role::Assistant => "PHILOSOPHER",
        };
        out.push_str(&format!("[{speaker}]\n{}\n\n{}\n\n", message.content, "-".repeat(40)));
    }
    out
}

pub async fn download_chat(
    State(state): State<AppState>,
    session: SessionIdentity,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let conversation = owned_conversation(&state, &session, &id).await?;
    let messages = state.repo.list_messages(&conversation.id).await?;
    let short: String = conversation.id.chars().take(8).collect();
    let disposition = format!("attachment; filename=\"chat-{short}.txt\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        transcript(&conversation, &messages),
    )
        .into_response())
}

pub async fn figures(State(state): State<AppState>) -> Json<Vec<PersonaSummary>> {
    Json(state.personas.summaries())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    fn conversation(title: Option<&str>) -> Conversation {
        Conversation {
            id: "0123456789".into(),
            session_id: "s".into(),
            title: title.map(str::to_string),
            created_at: now(),
        }
    }

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: content.into(),
            conversation_id: "0123456789".into(),
            role,
            content: content.into(),
            created_at: now(),
        }
    }

    #[test]
    fn summary_falls_back_to_first_user_message() {
        let long = "w".repeat(120);
        let messages = vec![message(Role::User, &long), message(Role::Assistant, "reply")];
        let summary = summarize(&conversation(None), &messages);
        assert_eq!(summary.title, format!("{}...", "w".repeat(TITLE_CHARS)));
        assert_eq!(summary.preview.chars().count(), PREVIEW_CHARS);
        assert_eq!(summary.message_count, 2);

        let titled = summarize(&conversation(Some("Chat with Hume")), &messages);
        assert_eq!(titled.title, "Chat with Hume");
        assert_eq!(summarize(&conversation(None), &[]).title, "Untitled");
    }

    #[test]
    fn transcript_labels_speakers() {
        let messages = vec![message(Role::User, "What is virtue?"), message(Role::Assistant, "Knowledge.")];
        let text = transcript(&conversation(Some("Chat with Plato")), &messages);
        assert!(text.starts_with("# Chat with Plato\n# Date: "));
        assert!(text.contains("[YOU]\nWhat is virtue?\n"));
        assert!(text.contains("[PHILOSOPHER]\nKnowledge.\n"));
    }
}
