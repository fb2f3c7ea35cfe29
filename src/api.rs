use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::CACHE_CONTROL;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::stream::client::stream_endpoint;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Name of the session cookie issued by the server on login.
pub const SESSION_COOKIE_NAME: &str = "semaphore";
/// Marker identifying template requests.
pub const TEMPLATE_MARKER: &str = "/tpl/";
/// Static asset location that template requests are rewritten to.
pub const TEMPLATE_ASSET_PREFIX: &str = "/public/html/";
/// Prefix applied to every backend API path.
pub const API_ROOT: &str = "/api";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// How requests authenticate against the server.
#[derive(Clone, Debug, Default)]
pub enum Credentials {
    /// Rely on no credentials at all.
    #[default]
    None,
    /// Value of the `semaphore` session cookie.
    SessionCookie(SecretString),
    /// API token sent as a bearer token.
    ApiToken(SecretString),
}

impl Credentials {
    pub fn session_cookie(value: impl Into<String>) -> Self {
        Self::SessionCookie(SecretString::new(value.into()))
    }

    pub fn api_token(token: impl Into<String>) -> Self {
        Self::ApiToken(SecretString::new(token.into()))
    }

    /// Header name and value carrying these credentials, if any.
    pub(crate) fn header(&self) -> Option<(&'static str, String)> {
        match self {
            Self::None => None,
            Self::SessionCookie(value) => Some((
                "cookie",
                format!("{SESSION_COOKIE_NAME}={}", value.expose_secret()),
            )),
            Self::ApiToken(token) => Some((
                "authorization",
                format!("Bearer {}", token.expose_secret()),
            )),
        }
    }
}

/// Outbound request path after rewriting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RewrittenRequest {
    pub path: String,
    /// Whether the request must carry `Cache-Control: no-cache`.
    pub no_cache: bool,
}

/// Maps an application path onto the path actually requested.
///
/// Template paths are redirected to static assets. Everything that is not a
/// static asset, an absolute URL or a bundled widget template is an API call:
/// it gets the [`API_ROOT`] prefix and must bypass caches.
pub fn rewrite_request_path(path: &str) -> RewrittenRequest {
    let path = if path.contains(TEMPLATE_MARKER) {
        path.replacen(TEMPLATE_MARKER, TEMPLATE_ASSET_PREFIX, 1)
    } else {
        path.to_string()
    };

    let passthrough =
        path.contains("/public") || path.contains("://") || path.contains("uib/template");
    if passthrough {
        return RewrittenRequest {
            path,
            no_cache: false,
        };
    }

    RewrittenRequest {
        path: format!("{API_ROOT}{path}"),
        no_cache: true,
    }
}

/// Identity returned by the user endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserIdentity {
    /// Zero when the server omits it.
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    origin: Url,
    credentials: Credentials,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new(origin: Url) -> Result<Self, ApiError> {
        Self::with_options(origin, Credentials::None, ApiClientOptions::default())
    }

    pub fn with_credentials(origin: Url, credentials: Credentials) -> Result<Self, ApiError> {
        Self::with_options(origin, credentials, ApiClientOptions::default())
    }

    pub fn with_options(
        origin: Url,
        credentials: Credentials,
        options: ApiClientOptions,
    ) -> Result<Self, ApiError> {
        if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
            return Err(ApiError::InvalidOrigin(origin.to_string()));
        }

        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            origin,
            credentials,
            request_timeout: options.request_timeout,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Websocket endpoint matching this client's origin.
    pub fn stream_endpoint(&self) -> Result<Url, ApiError> {
        stream_endpoint(&self.origin).map_err(|err| ApiError::InvalidOrigin(err.to_string()))
    }

    /// Resolves the identity behind the configured credentials.
    pub async fn current_user(&self) -> Result<UserIdentity, ApiError> {
        let body = self.send(Method::GET, "/user").await?;
        parse_user_identity(&body)
    }

    /// Ends the server-side session.
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.send(Method::POST, "/auth/logout").await?;
        Ok(())
    }

    /// Checks that the server is reachable.
    pub async fn ping(&self) -> Result<(), ApiError> {
        let body = self.send(Method::GET, "/ping").await?;
        if body.trim() == "PONG" {
            Ok(())
        } else {
            Err(ApiError::Parse(format!(
                "unexpected ping response: {}",
                summarize_error_body(&body)
            )))
        }
    }

    fn endpoint(&self, path: &str) -> Result<(Url, bool), ApiError> {
        let rewritten = rewrite_request_path(path);
        let url = self.origin.join(&rewritten.path)?;
        Ok((url, rewritten.no_cache))
    }

    async fn send(&self, method: Method, path: &str) -> Result<String, ApiError> {
        let (url, no_cache) = self.endpoint(path)?;
        let mut builder = self
            .http
            .request(method, url)
            .timeout(self.request_timeout);

        if no_cache {
            builder = builder.header(CACHE_CONTROL, "no-cache");
        }
        if let Some((name, value)) = self.credentials.header() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(body)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("origin", &self.origin.as_str())
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid request url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("origin must be an http(s) url with a host: {0}")]
    InvalidOrigin(String),
}

impl ApiError {
    /// True when the server rejected the credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

fn parse_user_identity(body: &str) -> Result<UserIdentity, ApiError> {
    serde_json::from_str(body).map_err(|err| ApiError::Parse(err.to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
