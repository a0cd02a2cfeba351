//! Outgoing connections: TCP or TLS, then an HTTP/1.1 handshake.
//!
//! Each connection's protocol driver runs on its own task. When the driver
//! ends, the connection is marked closed and the `on_close` hook fires so the
//! pool can evict it from the idle set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::net::{tls, ConnectionId};
use crate::pool::Poolable;
use crate::rpc::{Endpoint, TransportError, TransportResult};

/// Hook invoked once when a connection's driver task ends.
pub type OnClose = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// One established HTTP/1.1 client connection.
///
/// Dropping it drops the request sender, which ends the driver and closes the
/// socket.
pub struct HttpConnection {
    id: ConnectionId,
    sender: SendRequest<Full<Bytes>>,
    closed: Arc<AtomicBool>,
}

impl HttpConnection {
    /// Wait until the connection can take a request.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        self.sender.ready().await
    }

    pub async fn send(&mut self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, hyper::Error> {
        self.sender.send_request(request).await
    }
}

impl Poolable for HttpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.sender.is_closed()
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Opens connections to endpoints.
#[derive(Clone)]
pub struct HttpConnector {
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            tls: tls::client_connector(),
        }
    }

    /// Use a custom TLS connector (private roots, test certificates).
    pub fn with_tls(mut self, tls: TlsConnector) -> Self {
        self.tls = tls;
        self
    }

    /// Connect and handshake within the connect timeout.
    pub async fn connect(&self, endpoint: &Endpoint, on_close: OnClose) -> TransportResult<HttpConnection> {
        match tokio::time::timeout(self.connect_timeout, self.establish(endpoint, on_close)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::connect(
                endpoint,
                format!("timed out after {:?}", self.connect_timeout),
            )),
        }
    }

    async fn establish(&self, endpoint: &Endpoint, on_close: OnClose) -> TransportResult<HttpConnection> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| TransportError::connect(endpoint, e))?;
        let _ = tcp.set_nodelay(true);

        if !endpoint.tls {
            return handshake(tcp, endpoint, on_close).await;
        }

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| TransportError::connect(endpoint, e))?;
        let stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::connect(endpoint, format!("TLS handshake: {e}")))?;
        handshake(stream, endpoint, on_close).await
    }
}

impl std::fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

async fn handshake<I>(io: I, endpoint: &Endpoint, on_close: OnClose) -> TransportResult<HttpConnection>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, driver) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| TransportError::connect(endpoint, e))?;

    let id = ConnectionId::new();
    let closed = Arc::new(AtomicBool::new(false));
    {
        let closed = Arc::clone(&closed);
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                tracing::debug!(endpoint = %endpoint, connection_id = %id, error = %e, "Connection driver failed");
            }
            closed.store(true, Ordering::Release);
            tracing::trace!(endpoint = %endpoint, connection_id = %id, "Connection closed");
            on_close(id);
        });
    }

    Ok(HttpConnection { id, sender, closed })
}
