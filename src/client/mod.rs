/// Client side of the chat: transport, cache and the reconciliation of
/// optimistic messages with the persisted list.
///
/// - `api` - HTTP transport (`ChatApi`) behind the `ChatTransport` trait
/// - `reconcile` - pure keep/retire check for one optimistic copy
/// - `session` - tagged-union state machine for one conversation view
/// - `store` - cached persisted messages
/// - `controller` - runs a turn end to end and publishes `ChatView`s
mod api;
mod controller;
mod notify;
mod reconcile;
mod session;
mod store;

pub use api::{ByteStream, ChatApi, ChatTransport, ClientError, ClientResult};
pub use controller::{ChatController, ChatView, TurnOutcome};
pub use notify::{LogNotifier, Notification, Notifier};
pub use reconcile::{Shadow, Verdict};
pub use session::{
    AssistantTrack, AuditLog, ChatSession, Flow, Reconciliation, RenderedMessage, SessionError,
    TurnPhase, UserTrack,
};
pub use store::MessageCache;
