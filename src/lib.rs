//! Realtime session client for Semaphore servers.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client for identity, logout and request path rewriting.
//! - `stream`: realtime websocket client, envelope dispatch and session bootstrap.
//! - `retry`: reconnect policy and timeout utilities.

/// HTTP API client, credentials and request rewriting.
pub mod api;
/// Reconnect and timeout helpers.
pub mod retry;
/// Realtime stream client, dispatcher, and session bootstrap.
pub mod stream;

pub use api::{ApiClient, ApiError, Credentials, UserIdentity};
pub use stream::client::{ConnectionState, StreamClientError};
pub use stream::dispatch::{EventDispatcher, EventSubscription, RemoteEvent};
pub use stream::proto::EventEnvelope;
pub use stream::session::{BootstrapOutcome, ClientOptions, Session, SessionBootstrapper};
