//! Realtime stream modules.
//!
//! - `proto`: envelope codec for inbound frames.
//! - `dispatch`: delayed, ordered local broadcast of decoded envelopes.
//! - `client`: websocket connection lifecycle and reconnect handling.
//! - `session`: identity bootstrap that gates the stream on authentication.

/// Websocket connection manager and connectors.
pub mod client;
/// Local broadcast of decoded envelopes.
pub mod dispatch;
/// Stream frame codec.
pub mod proto;
/// Session bootstrap and authentication gating.
pub mod session;
