//! Sophia: streaming chat with philosophical personas and an optional audit
//! trace of the retrieval behind each answer.
//!
//! - `stream` - wire codec and the client-side reader loop
//! - `client` - optimistic messages reconciled with the persisted list
//! - `server` - axum routes and the per-turn orchestrator
//! - `retrieval` - corpus search, trace and audit report
//! - `ai` - generation backends
//! - `storage` - conversations and messages

pub mod ai;
pub mod client;
pub mod config;
pub mod persona;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod stream;
pub mod trace;
pub mod types;
