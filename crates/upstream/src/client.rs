//! WebSocket transport for the upstream connection.
//!
//! [`UpstreamClient`] holds the target URL. Call
//! [`UpstreamClient::connect`] to perform the handshake and obtain a
//! live [`UpstreamStream`].

use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// A live WebSocket connection to the upstream server.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection handle for the upstream server.
pub struct UpstreamClient {
    url: String,
    connect_timeout: Duration,
}

impl UpstreamClient {
    /// * `url` - WebSocket URL, e.g. `wss://host/wss`.
    /// * `connect_timeout` - Bound on the TCP connect plus handshake.
    pub fn new(url: String, connect_timeout: Duration) -> Self {
        Self { url, connect_timeout }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the WebSocket connection.
    ///
    /// A peer that accepts TCP but never completes the handshake fails
    /// with [`UpstreamError::Timeout`] after `connect_timeout`.
    pub async fn connect(&self) -> Result<UpstreamStream, UpstreamError> {
        let handshake = connect_async(self.url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| UpstreamError::Timeout(self.connect_timeout))?
            .map_err(|e| {
                UpstreamError::Connection(format!(
                    "Failed to connect to upstream at {}: {e}",
                    self.url
                ))
            })?;
        Ok(ws_stream)
    }
}

/// Errors that can occur when opening the upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The TCP connect or WebSocket handshake failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The handshake did not complete in time.
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
}
