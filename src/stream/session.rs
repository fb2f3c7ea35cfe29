//! Session bootstrap: resolve the current user, then start the stream.
//!
//! `SessionBootstrapper` is the only writer of the [`Session`] and the only
//! owner of the [`ConnectionManager`]. Everything else reads through its
//! accessors or a `watch` receiver. The stream runs only while the session is
//! authenticated; a failed identity lookup routes to the login state instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{ApiClient, ApiClientOptions, ApiError, Credentials, UserIdentity};
use crate::retry::ReconnectPolicy;
use crate::stream::client::{
    ConnectionManager, ConnectionState, ConnectionStatsSnapshot, Connector, StreamOptions,
    WsConnector,
};
use crate::stream::dispatch::{EventDispatcher, EventSubscription};

/// Navigation state requested when the user must sign in.
pub const LOGIN_STATE: &str = "auth.login";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const DISPATCH_DELAY: Duration = EventDispatcher::DEFAULT_DELAY;
    pub const RECONNECT_DELAY: Duration = ReconnectPolicy::DEFAULT_DELAY;
    pub const CONNECT_TIMEOUT: Duration = StreamOptions::DEFAULT_CONNECT_TIMEOUT;
}

/// Tunables for the whole realtime client.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Delay between decoding an envelope and delivering it.
    pub dispatch_delay: Duration,
    pub stream: StreamOptions,
    pub api: ApiClientOptions,
}

impl ClientOptions {
    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.stream.reconnect = ReconnectPolicy::fixed(delay);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.stream.connect_timeout = timeout;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dispatch_delay: ClientDefaults::DISPATCH_DELAY,
            stream: StreamOptions {
                reconnect: ReconnectPolicy::fixed(ClientDefaults::RECONNECT_DELAY),
                connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            },
            api: ApiClientOptions::default(),
        }
    }
}

/// Current authentication state.
///
/// Construct with [`Session::anonymous`] or [`Session::authenticated`]; an
/// authenticated session always carries a user.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    user: Option<UserIdentity>,
    authenticated: bool,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(user: UserIdentity) -> Self {
        Self {
            user: Some(user),
            authenticated: true,
        }
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// Backend calls the bootstrapper depends on.
pub trait AuthBackend: Send + Sync {
    fn current_user(&self) -> impl Future<Output = Result<UserIdentity, ApiError>> + Send;

    fn logout(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl AuthBackend for ApiClient {
    fn current_user(&self) -> impl Future<Output = Result<UserIdentity, ApiError>> + Send {
        ApiClient::current_user(self)
    }

    fn logout(&self) -> impl Future<Output = Result<(), ApiError>> + Send {
        ApiClient::logout(self)
    }
}

/// Receives navigation requests. The bootstrapper never navigates itself.
pub trait Navigator: Send + Sync {
    fn navigate(&self, state: &str);
}

impl<F> Navigator for F
where
    F: Fn(&str) + Send + Sync,
{
    fn navigate(&self, state: &str) {
        self(state)
    }
}

/// Result of [`SessionBootstrapper::refresh_session`].
#[derive(Debug)]
pub enum BootstrapOutcome {
    /// Identity resolved and the stream was started.
    Authenticated(UserIdentity),
    /// Identity lookup failed; navigation to [`LOGIN_STATE`] was requested.
    LoginRequired(ApiError),
}

impl BootstrapOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

pub struct SessionBootstrapper<A, C, N>
where
    A: AuthBackend,
    C: Connector,
    N: Navigator,
{
    auth: A,
    connector: Arc<C>,
    navigator: N,
    endpoint: Url,
    dispatcher: EventDispatcher,
    stream_options: StreamOptions,
    session: watch::Sender<Session>,
    connection: Option<ConnectionManager<C>>,
}

impl<N: Navigator> SessionBootstrapper<ApiClient, WsConnector, N> {
    /// Builds a bootstrapper talking to the server at `origin`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn for_origin(
        origin: Url,
        credentials: Credentials,
        navigator: N,
        options: ClientOptions,
    ) -> Result<Self, ApiError> {
        let api = ApiClient::with_options(origin, credentials.clone(), options.api.clone())?;
        let endpoint = api.stream_endpoint()?;
        Ok(Self::new(
            api,
            WsConnector::new(credentials),
            navigator,
            endpoint,
            &options,
        ))
    }
}

impl<A, C, N> SessionBootstrapper<A, C, N>
where
    A: AuthBackend,
    C: Connector,
    N: Navigator,
{
    /// Must be called inside a tokio runtime.
    pub fn new(
        auth: A,
        connector: C,
        navigator: N,
        endpoint: Url,
        options: &ClientOptions,
    ) -> Self {
        let (session, _) = watch::channel(Session::anonymous());
        Self {
            auth,
            connector: Arc::new(connector),
            navigator,
            endpoint,
            dispatcher: EventDispatcher::new(options.dispatch_delay),
            stream_options: options.stream.clone(),
            session,
            connection: None,
        }
    }

    /// Resolves the current user and starts the stream on success.
    ///
    /// Any previous connection is stopped and its undelivered events are
    /// dropped first, so calling this again simply restarts the flow.
    /// Failures are handled here and reported in the outcome; they never
    /// leave the session authenticated.
    pub async fn refresh_session(&mut self) -> BootstrapOutcome {
        self.stop_connection();
        self.dispatcher.cancel_pending();
        self.session.send_replace(Session::anonymous());

        match self.auth.current_user().await {
            Ok(user) => {
                info!(event = "session_authenticated", user_id = user.id);
                self.session.send_replace(Session::authenticated(user.clone()));
                self.start_connection();
                BootstrapOutcome::Authenticated(user)
            }
            Err(err) => {
                warn!(event = "session_login_required", error = %err);
                self.navigator.navigate(LOGIN_STATE);
                BootstrapOutcome::LoginRequired(err)
            }
        }
    }

    /// Tears the session down and routes to login.
    ///
    /// The pending reconnect and all undelivered events are cancelled. A
    /// failing server-side logout is logged and otherwise ignored.
    pub async fn logout(&mut self) {
        self.stop_connection();
        self.dispatcher.cancel_pending();

        if let Err(err) = self.auth.logout().await {
            warn!(event = "logout_failed", error = %err);
        }

        self.session.send_replace(Session::anonymous());
        info!(event = "session_logged_out");
        self.navigator.navigate(LOGIN_STATE);
    }

    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    /// Returns a receiver that observes every session change.
    pub fn subscribe_session(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(ConnectionManager::state)
            .unwrap_or_default()
    }

    /// Returns a receiver for the live connection's state, if one exists.
    pub fn subscribe_connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.connection
            .as_ref()
            .map(ConnectionManager::subscribe_state)
    }

    pub fn connection_stats(&self) -> Option<ConnectionStatsSnapshot> {
        self.connection.as_ref().map(ConnectionManager::stats)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Subscribes to a channel key such as `remote.update`.
    pub fn subscribe(&self, key: impl Into<String>) -> EventSubscription {
        self.dispatcher.subscribe(key)
    }

    fn start_connection(&mut self) {
        let mut manager = ConnectionManager::from_shared(
            self.endpoint.clone(),
            Arc::clone(&self.connector),
            self.dispatcher.clone(),
            self.stream_options.clone(),
        );
        if let Err(err) = manager.start() {
            warn!(event = "stream_start_failed", error = %err);
        }
        self.connection = Some(manager);
    }

    fn stop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            debug!(event = "stream_superseded", endpoint = %connection.endpoint());
            connection.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use reqwest::StatusCode;
    use url::Url;

    use super::{
        AuthBackend, BootstrapOutcome, ClientOptions, Navigator, Session, SessionBootstrapper,
        LOGIN_STATE,
    };
    use crate::api::{ApiError, UserIdentity};
    use crate::stream::client::testing::{FakeConnector, FakeServer};
    use crate::stream::client::ConnectionState;

    /// How the identity lookup fails when no user is configured.
    #[derive(Clone, Copy, Debug)]
    enum LookupFailure {
        Status(StatusCode),
        Unparseable,
    }

    impl LookupFailure {
        fn to_error(self) -> ApiError {
            match self {
                Self::Status(status) => ApiError::HttpStatus {
                    status,
                    body: status.to_string(),
                },
                Self::Unparseable => ApiError::Parse("expected value at line 1 column 1".into()),
            }
        }
    }

    struct FakeAuth {
        user: Mutex<Option<UserIdentity>>,
        failure: Mutex<LookupFailure>,
        lookups: AtomicUsize,
        logouts: AtomicUsize,
    }

    impl FakeAuth {
        fn with_user(user: Option<UserIdentity>) -> Arc<Self> {
            Arc::new(Self {
                user: Mutex::new(user),
                failure: Mutex::new(LookupFailure::Status(StatusCode::UNAUTHORIZED)),
                lookups: AtomicUsize::new(0),
                logouts: AtomicUsize::new(0),
            })
        }

        fn failing_with(failure: LookupFailure) -> Arc<Self> {
            let auth = Self::with_user(None);
            *auth.failure.lock().expect("failure lock") = failure;
            auth
        }
    }

    impl AuthBackend for Arc<FakeAuth> {
        fn current_user(&self) -> impl Future<Output = Result<UserIdentity, ApiError>> + Send {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let result = match self.user.lock().expect("user lock").clone() {
                Some(user) => Ok(user),
                None => Err(self.failure.lock().expect("failure lock").to_error()),
            };
            async move { result }
        }

        fn logout(&self) -> impl Future<Output = Result<(), ApiError>> + Send {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNavigator(Arc<Mutex<Vec<String>>>);

    impl RecordingNavigator {
        fn visited(&self) -> Vec<String> {
            self.0.lock().expect("navigator lock").clone()
        }
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, state: &str) {
            self.0.lock().expect("navigator lock").push(state.to_string());
        }
    }

    type TestBootstrapper = SessionBootstrapper<Arc<FakeAuth>, FakeConnector, RecordingNavigator>;

    fn alice() -> UserIdentity {
        UserIdentity {
            id: 7,
            name: "alice".to_string(),
            username: String::new(),
            email: String::new(),
            admin: false,
            extra: BTreeMap::new(),
        }
    }

    fn bob() -> UserIdentity {
        UserIdentity {
            id: 8,
            name: "bob".to_string(),
            ..alice()
        }
    }

    fn new_bootstrapper(
        auth: Arc<FakeAuth>,
    ) -> (
        TestBootstrapper,
        tokio::sync::mpsc::UnboundedReceiver<FakeServer>,
        Arc<AtomicUsize>,
        RecordingNavigator,
    ) {
        let (connector, servers) = FakeConnector::new();
        let attempts = connector.attempts.clone();
        let navigator = RecordingNavigator::default();
        let bootstrapper = SessionBootstrapper::new(
            auth,
            connector,
            navigator.clone(),
            Url::parse("ws://semaphore.test/api/ws").expect("endpoint"),
            &ClientOptions::default(),
        );
        (bootstrapper, servers, attempts, navigator)
    }

    async fn wait_until_open(bootstrapper: &TestBootstrapper) {
        let mut rx = bootstrapper
            .subscribe_connection_state()
            .expect("live connection");
        rx.wait_for(|state| *state == ConnectionState::Open)
            .await
            .expect("state channel open");
    }

    #[tokio::test(start_paused = true)]
    async fn successful_lookup_authenticates_and_starts_stream_once() {
        let auth = FakeAuth::with_user(Some(alice()));
        let (mut bootstrapper, mut servers, attempts, navigator) = new_bootstrapper(auth.clone());

        let outcome = bootstrapper.refresh_session().await;
        assert!(outcome.is_authenticated());

        let session = bootstrapper.session();
        assert!(session.is_authenticated());
        assert_eq!(session.user().map(|user| user.name.as_str()), Some("alice"));

        let _server = servers.recv().await.expect("stream connect");
        wait_until_open(&bootstrapper).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(auth.lookups.load(Ordering::SeqCst), 1);
        assert!(navigator.visited().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_routes_to_login_without_stream() {
        let auth = FakeAuth::with_user(None);
        let (mut bootstrapper, mut servers, attempts, navigator) = new_bootstrapper(auth);

        let outcome = bootstrapper.refresh_session().await;
        match outcome {
            BootstrapOutcome::LoginRequired(err) => assert!(err.is_unauthorized()),
            other => panic!("unexpected outcome: {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bootstrapper.session(), Session::anonymous());
        assert_eq!(bootstrapper.connection_state(), ConnectionState::Idle);
        assert!(bootstrapper.connection_stats().is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(servers.try_recv().is_err());
        assert_eq!(navigator.visited(), vec![LOGIN_STATE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn any_lookup_failure_routes_to_login() {
        for failure in [
            LookupFailure::Status(StatusCode::INTERNAL_SERVER_ERROR),
            LookupFailure::Status(StatusCode::BAD_GATEWAY),
            LookupFailure::Unparseable,
        ] {
            let (mut bootstrapper, mut servers, attempts, navigator) =
                new_bootstrapper(FakeAuth::failing_with(failure));

            let outcome = bootstrapper.refresh_session().await;
            match outcome {
                BootstrapOutcome::LoginRequired(err) => {
                    assert!(!err.is_unauthorized(), "{failure:?} reported as {err}");
                }
                other => panic!("{failure:?} produced {other:?}"),
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
            assert!(!bootstrapper.session().is_authenticated());
            assert_eq!(attempts.load(Ordering::SeqCst), 0);
            assert!(servers.try_recv().is_err());
            assert_eq!(navigator.visited(), vec![LOGIN_STATE.to_string()]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stream_starts_if_and_only_if_lookup_succeeds() {
        for user in [Some(alice()), None] {
            let expect_stream = user.is_some();
            let (mut bootstrapper, _servers, attempts, _navigator) =
                new_bootstrapper(FakeAuth::with_user(user));

            bootstrapper.refresh_session().await;
            tokio::time::sleep(Duration::from_millis(10)).await;

            assert_eq!(attempts.load(Ordering::SeqCst) == 1, expect_stream);
            assert_eq!(bootstrapper.session().is_authenticated(), expect_stream);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_refresh_supersedes_previous_connection() {
        let auth = FakeAuth::with_user(Some(alice()));
        let (mut bootstrapper, mut servers, attempts, _navigator) = new_bootstrapper(auth);

        bootstrapper.refresh_session().await;
        let first = servers.recv().await.expect("first connect");
        wait_until_open(&bootstrapper).await;

        bootstrapper.refresh_session().await;
        let _second = servers.recv().await.expect("second connect");
        wait_until_open(&bootstrapper).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(first.frames.is_closed());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(bootstrapper.connection_stats().map(|s| s.connect_attempts), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_after_login_clears_session() {
        let auth = FakeAuth::with_user(Some(alice()));
        let (mut bootstrapper, mut servers, _attempts, navigator) = new_bootstrapper(auth.clone());

        bootstrapper.refresh_session().await;
        let first = servers.recv().await.expect("connect");
        wait_until_open(&bootstrapper).await;

        *auth.user.lock().expect("user lock") = None;
        let outcome = bootstrapper.refresh_session().await;
        assert!(!outcome.is_authenticated());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(first.frames.is_closed());
        assert!(servers.try_recv().is_err());
        assert!(!bootstrapper.session().is_authenticated());
        assert_eq!(navigator.visited(), vec![LOGIN_STATE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_cancels_stream_and_pending_events() {
        let auth = FakeAuth::with_user(Some(alice()));
        let (mut bootstrapper, mut servers, attempts, navigator) = new_bootstrapper(auth.clone());
        let mut subscription = bootstrapper.subscribe("remote.update");

        bootstrapper.refresh_session().await;
        let server = servers.recv().await.expect("connect");
        wait_until_open(&bootstrapper).await;

        server.send_text(r#"{"type":"update","project_id":1}"#);
        while bootstrapper
            .connection_stats()
            .is_some_and(|stats| stats.frames_received == 0)
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        bootstrapper.logout().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(subscription.try_recv().is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(auth.logouts.load(Ordering::SeqCst), 1);
        assert!(!bootstrapper.session().is_authenticated());
        assert_eq!(bootstrapper.connection_state(), ConnectionState::Idle);
        assert_eq!(navigator.visited(), vec![LOGIN_STATE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_drops_events_queued_for_the_previous_user() {
        let auth = FakeAuth::with_user(Some(alice()));
        let (mut bootstrapper, mut servers, _attempts, _navigator) =
            new_bootstrapper(auth.clone());
        let mut subscription = bootstrapper.subscribe("remote.update");

        bootstrapper.refresh_session().await;
        let alice_server = servers.recv().await.expect("alice connect");
        wait_until_open(&bootstrapper).await;

        alice_server.send_text(r#"{"type":"update","owner":"alice"}"#);
        while bootstrapper
            .connection_stats()
            .is_some_and(|stats| stats.frames_received == 0)
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        *auth.user.lock().expect("user lock") = Some(bob());
        assert!(bootstrapper.refresh_session().await.is_authenticated());
        let bob_server = servers.recv().await.expect("bob connect");
        wait_until_open(&bootstrapper).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(subscription.try_recv().is_none());
        assert_eq!(bootstrapper.session().user().map(|user| user.id), Some(8));

        bob_server.send_text(r#"{"type":"update","owner":"bob"}"#);
        let event = subscription.recv().await.expect("bob's event");
        assert_eq!(event.envelope.get("owner"), Some(&serde_json::json!("bob")));
    }

    #[tokio::test(start_paused = true)]
    async fn session_changes_are_observable() {
        let auth = FakeAuth::with_user(Some(alice()));
        let (mut bootstrapper, _servers, _attempts, _navigator) = new_bootstrapper(auth);
        let mut session_rx = bootstrapper.subscribe_session();
        assert!(!session_rx.borrow().is_authenticated());

        bootstrapper.refresh_session().await;
        let session = session_rx
            .wait_for(Session::is_authenticated)
            .await
            .expect("session channel open")
            .clone();
        assert_eq!(session.user().map(|user| user.id), Some(7));
    }

    #[test]
    fn closures_can_navigate() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let navigator = {
            let visited = Arc::clone(&visited);
            move |state: &str| visited.lock().expect("lock").push(state.to_string())
        };
        navigator.navigate(LOGIN_STATE);
        assert_eq!(*visited.lock().expect("lock"), vec!["auth.login".to_string()]);
    }
}
