//! Backend relay issuing short-lived session credentials

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::retry::is_recoverable_status;
use crate::{Error, Result, Voice};

/// Per-request limit for relay calls
const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters for a new realtime session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub model: String,
    pub voice: Voice,
    pub instructions: String,
}

/// Single-use, time-limited credential for one realtime session
///
/// Deliberately not `Clone`: the transport consumes it when opening the channel.
#[derive(Debug)]
pub struct SessionTicket {
    token: SecretString,
    expires_at: DateTime<Utc>,
    url: Option<String>,
}

impl SessionTicket {
    #[must_use]
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
            url: None,
        }
    }

    /// Endpoint to connect to instead of the configured one
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Bearer token for the channel handshake
    #[must_use]
    pub fn expose_token(&self) -> &str {
        self.token.expose_secret()
    }

    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Whether the ticket can no longer be used
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Source of session tickets
#[async_trait]
pub trait SessionRelay: Send + Sync {
    /// Request a fresh ticket for `request`
    ///
    /// # Errors
    ///
    /// `SessionCreationFailed` when the relay is unreachable or overloaded,
    /// `FatalProtocol` when it rejects the request outright
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionTicket>;
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(alias = "client_secret")]
    token: String,
    /// Unix seconds
    expires_at: i64,
    #[serde(default)]
    url: Option<String>,
}

/// Relay reached over HTTP
pub struct HttpSessionRelay {
    client: reqwest::Client,
    url: String,
}

impl HttpSessionRelay {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(RELAY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SessionRelay for HttpSessionRelay {
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionTicket> {
        tracing::debug!(url = %self.url, voice = %request.voice, "requesting realtime session");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::SessionCreationFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("relay returned {status}: {body}");
            return Err(if is_recoverable_status(status.as_u16()) {
                Error::SessionCreationFailed(detail)
            } else {
                Error::FatalProtocol(detail)
            });
        }

        let body: RelayResponse = response
            .json()
            .await
            .map_err(|e| Error::SessionCreationFailed(format!("invalid relay response: {e}")))?;
        ticket_from_response(body)
    }
}

fn ticket_from_response(body: RelayResponse) -> Result<SessionTicket> {
    let expires_at = DateTime::from_timestamp(body.expires_at, 0).ok_or_else(|| {
        Error::SessionCreationFailed(format!("invalid ticket expiry: {}", body.expires_at))
    })?;

    let mut ticket = SessionTicket::new(body.token, expires_at);
    if let Some(url) = body.url {
        ticket = ticket.with_url(url);
    }
    if ticket.is_expired() {
        return Err(Error::SessionCreationFailed(
            "relay issued an expired ticket".to_string(),
        ));
    }
    Ok(ticket)
}
