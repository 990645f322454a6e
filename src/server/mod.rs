//! HTTP server: chat streaming endpoints plus conversation management.
//!
//! Callers are identified by the `x-session-id` header. Every route reads
//! and writes through the same [`MessageRepository`], and both streaming
//! endpoints go through the [`Orchestrator`].

mod error;
mod identity;
mod orchestrator;
mod routes;

pub use error::ApiError;
pub use identity::{ANONYMOUS, SessionIdentity};
pub use orchestrator::{Orchestrator, with_document};
pub use routes::{summarize, transcript};

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::ai::LLMBackend;
use crate::persona::PersonaRegistry;
use crate::retrieval::Retriever;
use crate::storage::MessageRepository;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn MessageRepository>,
    pub personas: Arc<PersonaRegistry>,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        personas: PersonaRegistry,
        retriever: Arc<dyn Retriever>,
        backend: Arc<dyn LLMBackend>,
        history_limit: usize,
    ) -> Self {
        let personas = Arc::new(personas);
        let orchestrator = Orchestrator::new(repo.clone(), personas.clone(), retriever, backend, history_limit);
        Self {
            repo,
            personas,
            orchestrator,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat/stream", post(routes::chat_stream))
        .route("/api/chat/stream-audited", post(routes::chat_stream_audited))
        .route("/api/messages", get(routes::list_messages))
        .route("/api/messages/{id}", delete(routes::delete_message))
        .route("/api/chat/new", post(routes::new_conversation))
        .route("/api/chat-history", get(routes::chat_history))
        .route("/api/chat/{id}", get(routes::get_chat))
        .route("/api/chat/{id}/download", get(routes::download_chat))
        .route("/api/figures", get(routes::figures))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "sophia listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await
}
