//! Establishing duplex channels.

use std::time::Duration;

use async_trait::async_trait;
use tokio_tungstenite::connect_async;
use url::Url;

use crate::duplex::channel::{self, DuplexChannel};
use crate::net::tls;
use crate::rpc::{TransportError, TransportResult};

/// Opens a duplex channel to a URL.
///
/// The keepalive session only needs this seam; tests substitute connectors
/// that fail or hand back in-memory channels.
#[async_trait]
pub trait DuplexConnector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> TransportResult<DuplexChannel>;
}

/// WebSocket connector (`ws://` and `wss://`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        // `wss://` handshakes build their rustls config from the process default.
        tls::install_crypto_provider();
        Self { connect_timeout }
    }
}

#[async_trait]
impl DuplexConnector for WsConnector {
    async fn connect(&self, url: &Url) -> TransportResult<DuplexChannel> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "duplex url must be ws:// or wss://, got '{url}'"
            )));
        }

        let (ws, response) = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Err(_) => return Err(TransportError::connect(url, "handshake timed out")),
            Ok(Err(e)) => return Err(TransportError::connect(url, e)),
            Ok(Ok(pair)) => pair,
        };

        tracing::debug!(url = %url, status = response.status().as_u16(), "Duplex handshake complete");
        Ok(channel::pump(ws, url.to_string()))
    }
}
