//! Stream connection lifecycle: open, detect closure, reconnect.
//!
//! [`ConnectionManager`] spawns a background worker that owns the socket.
//! The worker decodes inbound text frames, hands envelopes to the
//! [`EventDispatcher`], and on any close waits a fixed delay before opening a
//! fresh socket. It never gives up on its own; only [`ConnectionManager::stop`]
//! or dropping the manager ends it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use crate::api::Credentials;
use crate::retry::{with_timeout, ReconnectPolicy, ReconnectWait};
use crate::stream::dispatch::EventDispatcher;
use crate::stream::proto::decode;

/// Path of the realtime endpoint on the page host.
pub const STREAM_PATH: &str = "/api/ws";

/// Derives the websocket endpoint from the page origin.
///
/// `https` origins map to `wss`, `http` origins to `ws`. Host and port are
/// kept; path, query and fragment are replaced by [`STREAM_PATH`].
pub fn stream_endpoint(origin: &Url) -> Result<Url, StreamClientError> {
    let scheme = match origin.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(StreamClientError::InvalidEndpoint(format!(
                "unsupported origin scheme `{other}`"
            )))
        }
    };
    let host = origin.host_str().ok_or_else(|| {
        StreamClientError::InvalidEndpoint(format!("origin `{origin}` has no host"))
    })?;
    let authority = match origin.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    Url::parse(&format!("{scheme}://{authority}{STREAM_PATH}"))
        .map_err(|err| StreamClientError::InvalidEndpoint(err.to_string()))
}

/// Lifecycle state of the single stream connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// `start` has not been called yet.
    #[default]
    Idle,
    Connecting,
    Open,
    /// Closed and waiting to reconnect, or stopped.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Errors produced by stream setup and transport handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Credentials could not be converted to a valid header value.
    #[error("invalid credential header: {0}")]
    InvalidCredentialHeader(#[from] InvalidHeaderValue),

    /// The stream endpoint could not be derived from the origin.
    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(String),

    /// Opening the socket took longer than the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// `start` was called while a connection is connecting or open.
    #[error("cannot start stream while {state}")]
    InvalidState { state: ConnectionState },
}

/// Why an established or attempted connection ended.
///
/// Every variant leads to the same fixed-delay reconnect.
#[derive(Debug, Error)]
pub enum TransportClose {
    #[error("connect failed: {0}")]
    Connect(StreamClientError),

    #[error("server closed the stream (code {code}): {reason}")]
    ServerClose { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(WsError),

    #[error("stream ended")]
    Ended,
}

impl TransportClose {
    fn from_close_frame(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self::ServerClose {
                code: u16::from(frame.code),
                reason: frame.reason.into_owned(),
            },
            // 1005: no status code present.
            None => Self::ServerClose {
                code: 1005,
                reason: String::new(),
            },
        }
    }
}

/// Counters updated by the connection worker.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connect_attempts: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    frames_received: AtomicU64,
    decode_failures: AtomicU64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStatsSnapshot {
    pub connect_attempts: u64,
    pub opened: u64,
    pub closed: u64,
    pub frames_received: u64,
    /// Frames dropped because they were not valid event envelopes.
    pub decode_failures: u64,
}

/// Socket type the worker can drive: a stream of inbound websocket messages
/// and a sink for outbound ones.
pub trait FrameSocket:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static
{
}

impl<T> FrameSocket for T where
    T: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static
{
}

/// Opens sockets for the connection worker.
pub trait Connector: Send + Sync + 'static {
    type Socket: FrameSocket;

    fn connect(
        &self,
        endpoint: &Url,
    ) -> impl Future<Output = Result<Self::Socket, StreamClientError>> + Send;
}

/// Websocket connector that sends session credentials on the handshake.
#[derive(Clone, Debug)]
pub struct WsConnector {
    credentials: Credentials,
}

impl WsConnector {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    fn handshake_request(&self, endpoint: &Url) -> Result<Request, StreamClientError> {
        let mut request = endpoint.as_str().into_client_request()?;
        if let Some((name, value)) = self.credentials.header() {
            let header_value = value.parse()?;
            request.headers_mut().insert(name, header_value);
        }
        Ok(request)
    }
}

impl Connector for WsConnector {
    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn connect(
        &self,
        endpoint: &Url,
    ) -> impl Future<Output = Result<Self::Socket, StreamClientError>> + Send {
        let request = self.handshake_request(endpoint);
        async move {
            let (socket, _) = connect_async(request?).await?;
            Ok(socket)
        }
    }
}

/// Timing options for the connection worker.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl StreamOptions {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Owner of the single stream connection.
pub struct ConnectionManager<C: Connector> {
    endpoint: Url,
    connector: Arc<C>,
    dispatcher: EventDispatcher,
    options: StreamOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    stats: Arc<ConnectionStats>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        endpoint: Url,
        connector: C,
        dispatcher: EventDispatcher,
        options: StreamOptions,
    ) -> Self {
        Self::from_shared(endpoint, Arc::new(connector), dispatcher, options)
    }

    /// Like [`ConnectionManager::new`] with a connector shared across managers.
    pub fn from_shared(
        endpoint: Url,
        connector: Arc<C>,
        dispatcher: EventDispatcher,
        options: StreamOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            endpoint,
            connector,
            dispatcher,
            options,
            state: Arc::new(state),
            stats: Arc::new(ConnectionStats::default()),
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Starts connecting.
    ///
    /// Valid from `Idle` or `Closed`. When a reconnect is already pending,
    /// the wait is cut short and the next attempt begins immediately.
    pub fn start(&mut self) -> Result<(), StreamClientError> {
        let state = self.state();

        if self.worker_running() {
            return match state {
                ConnectionState::Closed => {
                    debug!(event = "reconnect_requested");
                    self.wake.notify_one();
                    Ok(())
                }
                _ => Err(StreamClientError::InvalidState { state }),
            };
        }

        if matches!(state, ConnectionState::Connecting | ConnectionState::Open) {
            return Err(StreamClientError::InvalidState { state });
        }

        // A wake left over from a previous worker must not shorten this one's delay.
        self.cancel = CancellationToken::new();
        self.wake = Arc::new(Notify::new());
        self.state.send_replace(ConnectionState::Connecting);

        let worker = WorkerContext {
            endpoint: self.endpoint.clone(),
            connector: Arc::clone(&self.connector),
            dispatcher: self.dispatcher.clone(),
            reconnect: self.options.reconnect.clone(),
            connect_timeout: self.options.connect_timeout,
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            wake: Arc::clone(&self.wake),
            cancel: self.cancel.clone(),
        };
        self.worker = Some(tokio::spawn(connection_worker(worker)));
        Ok(())
    }

    /// Closes the socket and cancels any pending reconnect.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.worker = None;
        if self.state() != ConnectionState::Idle {
            self.state.send_replace(ConnectionState::Closed);
        }
    }

    fn worker_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<C: Connector> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct WorkerContext<C> {
    endpoint: Url,
    connector: Arc<C>,
    dispatcher: EventDispatcher,
    reconnect: ReconnectPolicy,
    connect_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    stats: Arc<ConnectionStats>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl<C> WorkerContext<C> {
    fn publish(&self, state: ConnectionState) {
        if !self.cancel.is_cancelled() {
            self.state.send_replace(state);
        }
    }

    fn handle_text(&self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        match decode(text) {
            Ok(envelope) => {
                let event_type = envelope.event_type.clone();
                let seq = self.dispatcher.dispatch(envelope);
                trace!(event = "frame_decoded", event_type = %event_type, seq);
            }
            Err(err) => self.drop_frame(&err),
        }
    }

    fn drop_frame(&self, reason: &dyn fmt::Display) {
        self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
        debug!(event = "frame_dropped", reason = %reason);
    }
}

enum SessionOutcome {
    Shutdown,
    Closed(TransportClose),
}

async fn connection_worker<C: Connector>(ctx: WorkerContext<C>) {
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        ctx.publish(ConnectionState::Connecting);
        ctx.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        info!(event = "stream_connecting", attempt, endpoint = %ctx.endpoint);

        match run_connected_session(&ctx).await {
            SessionOutcome::Shutdown => {
                debug!(event = "stream_worker_stopped", attempt);
                return;
            }
            SessionOutcome::Closed(reason) => {
                ctx.stats.closed.fetch_add(1, Ordering::Relaxed);
                ctx.publish(ConnectionState::Closed);
                info!(event = "stream_closed", attempt, reason = %reason, "stream closed, retrying");
            }
        }

        match ctx.reconnect.wait(attempt, &ctx.wake, &ctx.cancel).await {
            ReconnectWait::Cancelled => {
                debug!(event = "stream_worker_stopped", attempt);
                return;
            }
            ReconnectWait::Elapsed | ReconnectWait::Woken => {}
        }
    }
}

async fn run_connected_session<C: Connector>(ctx: &WorkerContext<C>) -> SessionOutcome {
    let connect = with_timeout(ctx.connect_timeout, ctx.connector.connect(&ctx.endpoint));

    let mut socket = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return SessionOutcome::Shutdown,
        result = connect => match result {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => return SessionOutcome::Closed(TransportClose::Connect(err)),
            Err(_) => {
                return SessionOutcome::Closed(TransportClose::Connect(
                    StreamClientError::ConnectTimeout(ctx.connect_timeout),
                ))
            }
        },
    };

    ctx.stats.opened.fetch_add(1, Ordering::Relaxed);
    ctx.publish(ConnectionState::Open);
    info!(event = "stream_open", endpoint = %ctx.endpoint);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = socket.close().await;
                return SessionOutcome::Shutdown;
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => ctx.handle_text(&text),
                    Some(Ok(Message::Binary(bytes))) => {
                        ctx.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        ctx.drop_frame(&format!("binary frame of {} bytes", bytes.len()));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            return SessionOutcome::Closed(TransportClose::Transport(err));
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        return SessionOutcome::Closed(TransportClose::from_close_frame(frame));
                    }
                    Some(Err(err)) => return SessionOutcome::Closed(TransportClose::Transport(err)),
                    None => return SessionOutcome::Closed(TransportClose::Ended),
                }
            }
        }
    }
}
