//! Websocket transport for the realtime service

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use url::Url;

use super::connection::{Connector, RealtimeChannel, SessionConfig};
use super::protocol::{ClientMessage, ServerEvent};
use super::relay::SessionTicket;
use crate::{Error, Result};

/// Default depth of the per-direction message queues
const DEFAULT_BUFFER: usize = 128;

/// Opens JSON-over-websocket channels with the ticket as a bearer token
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    buffer: usize,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
        }
    }
}

impl WebSocketConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Endpoint for `config`, preferring the one carried by the ticket
fn endpoint(ticket: &SessionTicket, config: &SessionConfig) -> Result<Url> {
    let base = ticket.url().unwrap_or(&config.realtime_url);
    let mut url =
        Url::parse(base).map_err(|e| Error::ConnectionFailed(format!("invalid endpoint {base}: {e}")))?;
    if !url.query_pairs().any(|(k, _)| k == "model") {
        url.query_pairs_mut().append_pair("model", &config.model);
    }
    Ok(url)
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, ticket: SessionTicket, config: &SessionConfig) -> Result<RealtimeChannel> {
        let url = endpoint(&ticket, config)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", ticket.expose_token()))
            .map_err(|e| Error::ConnectionFailed(format!("invalid session token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        drop(ticket);

        tracing::debug!(host = url.host_str().unwrap_or_default(), "opening realtime websocket");
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(self.buffer);

        // Writer: ends when the connection drops its sender
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize realtime message");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "realtime websocket send failed");
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            tracing::debug!("realtime websocket writer finished");
        });

        // Reader: ends when the remote closes or the connection stops listening
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            if in_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "unparseable realtime event"),
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "realtime websocket closed by remote");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "realtime websocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(RealtimeChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
