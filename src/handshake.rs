//! REST calls against the voice agent server
//!
//! `POST /start-session` provisions a session and names the streaming
//! endpoint. The other calls (`/health`, `/sessions`) are incidental
//! management endpoints used by the CLI.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::HandshakeError;
use crate::protocol::{ConfigEcho, SessionConfig};
use crate::{Error, Result};

/// Longest response body quoted in an error
const MAX_ERROR_BODY: usize = 200;

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    /// Server-issued session identifier
    pub session_id: String,
    /// Streaming endpoint, resolved and ready to dial
    pub endpoint: Url,
    /// Config as echoed by the server
    pub config: ConfigEcho,
}

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    session_id: String,
    websocket_url: String,
    #[serde(default)]
    config: ConfigEcho,
}

/// `GET /health` response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub active_sessions: u64,
    #[serde(default)]
    pub memory_enabled: bool,
}

/// One entry of `GET /sessions`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub voice_id: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionList {
    sessions: Vec<SessionSummary>,
}

/// Client for the server's REST surface
#[derive(Debug, Clone)]
pub struct HandshakeClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HandshakeClient {
    /// Create a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the HTTP client cannot be built
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid server URL '{base_url}': {e}")))?;
        // Relative joins must keep a path prefix such as `/voice`
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "server URL must be http or https, got '{}'",
                base_url.scheme()
            )));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    /// Server base URL
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Create a session; a single attempt, never retried
    ///
    /// # Errors
    ///
    /// Returns `HttpStatus` for any status other than 200, `Malformed` if the
    /// body is not a valid grant, `NetworkUnreachable` if the request fails
    pub async fn create_session(
        &self,
        config: &SessionConfig,
    ) -> std::result::Result<SessionGrant, HandshakeError> {
        let url = self.url("start-session")?;
        tracing::debug!(
            url = %self.base_url,
            voice_id = %config.voice_id,
            tts_engine = %config.tts_engine,
            "creating session"
        );

        let response = self
            .client
            .post(url)
            .json(config)
            .send()
            .await
            .map_err(network_error)?;

        let body: StartSessionResponse = read_json(response).await?;

        if body.session_id.trim().is_empty() {
            return Err(HandshakeError::Malformed("empty session_id".to_string()));
        }
        let endpoint = self.resolve_endpoint(&body.websocket_url)?;

        tracing::info!(session_id = %body.session_id, endpoint = %redact(&endpoint), "session created");

        Ok(SessionGrant {
            session_id: body.session_id,
            endpoint,
            config: body.config,
        })
    }

    /// Query server health
    ///
    /// # Errors
    ///
    /// Same kinds as [`HandshakeClient::create_session`]
    pub async fn health(&self) -> std::result::Result<HealthStatus, HandshakeError> {
        let response = self
            .client
            .get(self.url("health")?)
            .send()
            .await
            .map_err(network_error)?;
        read_json(response).await
    }

    /// List sessions the server knows about
    ///
    /// # Errors
    ///
    /// Same kinds as [`HandshakeClient::create_session`]
    pub async fn list_sessions(&self) -> std::result::Result<Vec<SessionSummary>, HandshakeError> {
        let response = self
            .client
            .get(self.url("sessions")?)
            .send()
            .await
            .map_err(network_error)?;
        let list: SessionList = read_json(response).await?;
        Ok(list.sessions)
    }

    /// Delete a session on the server
    ///
    /// # Errors
    ///
    /// Returns `HttpStatus` with 404 if the session does not exist
    pub async fn delete_session(&self, session_id: &str) -> std::result::Result<(), HandshakeError> {
        let mut url = self.url("sessions")?;
        url.path_segments_mut()
            .map_err(|()| HandshakeError::Malformed("server URL cannot have a path".to_string()))?
            .push(session_id);

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(network_error)?;
        let _: serde_json::Value = read_json(response).await?;
        Ok(())
    }

    /// Turn the handshake's `websocket_url` into a dialable endpoint
    ///
    /// Absolute URLs are authoritative. Relative paths are joined to the
    /// server URL. HTTP schemes become their websocket equivalents and the
    /// API key, if any, is added as a query parameter.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the value cannot be turned into a websocket URL
    pub fn resolve_endpoint(&self, websocket_url: &str) -> std::result::Result<Url, HandshakeError> {
        let raw = websocket_url.trim();
        if raw.is_empty() {
            return Err(HandshakeError::Malformed("empty websocket_url".to_string()));
        }

        let mut endpoint = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .join(raw)
                .map_err(|e| HandshakeError::Malformed(format!("bad websocket_url '{raw}': {e}")))?,
            Err(e) => {
                return Err(HandshakeError::Malformed(format!(
                    "bad websocket_url '{raw}': {e}"
                )));
            }
        };

        let scheme = match endpoint.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(HandshakeError::Malformed(format!(
                    "unsupported websocket scheme '{other}'"
                )));
            }
        };
        endpoint
            .set_scheme(scheme)
            .map_err(|()| HandshakeError::Malformed(format!("cannot use scheme {scheme}")))?;

        if let Some(key) = &self.api_key {
            if !endpoint.query_pairs().any(|(k, _)| k == "api_key") {
                endpoint.query_pairs_mut().append_pair("api_key", key);
            }
        }

        Ok(endpoint)
    }

    fn url(&self, path: &str) -> std::result::Result<Url, HandshakeError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| HandshakeError::Malformed(format!("bad request path '{path}': {e}")))?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("api_key", key);
        }
        Ok(url)
    }
}

fn network_error(e: reqwest::Error) -> HandshakeError {
    HandshakeError::NetworkUnreachable(e.without_url().to_string())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> std::result::Result<T, HandshakeError> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|&i| body.is_char_boundary(i))
                .unwrap_or(0);
            body.truncate(cut);
        }
        return Err(HandshakeError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await.map_err(network_error)?;
    serde_json::from_slice(&bytes).map_err(|e| HandshakeError::Malformed(e.to_string()))
}

/// Endpoint for logging, without the API key
#[must_use]
pub fn redact(endpoint: &Url) -> String {
    let mut shown = endpoint.clone();
    if shown.query().is_some() {
        let pairs: Vec<(String, String)> = shown
            .query_pairs()
            .map(|(k, v)| {
                let v = if k == "api_key" { "***".into() } else { v.into_owned() };
                (k.into_owned(), v)
            })
            .collect();
        shown.query_pairs_mut().clear().extend_pairs(pairs);
    }
    shown.to_string()
}
