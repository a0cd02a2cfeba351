//! Server side of the transport.
//!
//! # Data Flow
//! ```text
//! Listener::accept (permit held for the connection's lifetime)
//!     → optional TLS handshake
//!     → handler.rs (ServerConnectionHandler state machine)
//!         → http1.rs (head parsing, body framing, response encoding)
//!         → registry.rs (service name → RpcHandler)
//!         → upgrade.rs (101 → duplex channel)
//!     → ConnectionSummary logged on close
//! ```
//!
//! # Design Decisions
//! - One request in flight per connection; pipelining closes the connection
//! - Oversized bodies are rejected from the declared length, before reading
//! - Shutdown stops accepting, lets in-flight requests finish, then drains

pub mod handler;
pub mod http1;
pub mod registry;
pub mod state;
pub mod upgrade;

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::net::{tls, ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;

pub use handler::{ServerConnectionHandler, ServerContext};
pub use registry::{handler_fn, CallContext, HandlerError, HandlerRegistry, RpcHandler};
pub use state::{CloseReason, ConnectionState, ConnectionSummary};

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Accept loop serving RPC requests over HTTP/1.1.
pub struct RpcServer {
    ctx: Arc<ServerContext>,
    tracker: ConnectionTracker,
    tls: Option<TlsAcceptor>,
}

impl RpcServer {
    /// Build a server with the JSON codec; loads TLS material when the
    /// config names it.
    pub fn new(config: ServerConfig, registry: HandlerRegistry) -> Result<Self, ServerError> {
        Self::from_context(ServerContext::new(config, registry))
    }

    /// Build a server around a prepared context (custom codec).
    pub fn from_context(ctx: ServerContext) -> Result<Self, ServerError> {
        let tls = match &ctx.config.tls {
            Some(tls) => Some(
                tls::load_tls_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path))
                    .map_err(ServerError::Tls)?,
            ),
            None => None,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            tracker: ConnectionTracker::new(),
            tls,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Live connection count, shared with the accept loop.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept until `shutdown` triggers, then drain open connections.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> Result<(), ServerError> {
        let mut stop = shutdown.signal();
        tracing::info!(
            address = ?listener.local_addr().ok(),
            services = self.ctx.registry.len(),
            tls = self.tls.is_some(),
            "RPC server starting"
        );

        loop {
            let accepted = tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    // Transient accept failures (EMFILE, ECONNABORTED) must not stop the loop.
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let guard = self.tracker.track();
            metrics::set_active_connections(self.tracker.active_count());
            let span = tracing::debug_span!("connection", id = %guard.id(), peer = %peer);
            let ctx = Arc::clone(&self.ctx);
            let tls = self.tls.clone();
            let signal = shutdown.signal();
            let tracker = self.tracker.clone();

            tokio::spawn(
                async move {
                    match tls {
                        Some(acceptor) => {
                            let limit = ctx.config.read_timeout();
                            if let Some(stream) = handshake_within(limit, acceptor.accept(stream)).await {
                                serve(stream, peer, ctx, signal).await;
                            }
                        }
                        None => serve(stream, peer, ctx, signal).await,
                    }
                    drop(permit);
                    drop(guard);
                    metrics::set_active_connections(tracker.active_count());
                }
                .instrument(span),
            );
        }

        let drain = self.ctx.config.drain_timeout();
        tracing::info!(
            active = self.tracker.active_count(),
            timeout_secs = drain.as_secs(),
            "Stopped accepting, draining connections"
        );
        if self.tracker.drain(drain).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Drain deadline passed with connections still open"
            );
        }
        Ok(())
    }
}

/// Finish a TLS handshake within `limit`; a stalled or failed one is dropped.
async fn handshake_within<S, F>(limit: Duration, handshake: F) -> Option<S>
where
    F: Future<Output = std::io::Result<S>>,
{
    match tokio::time::timeout(limit, handshake).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "TLS handshake failed");
            None
        }
        Err(_) => {
            tracing::debug!(timeout_ms = limit.as_millis() as u64, "TLS handshake timed out");
            None
        }
    }
}

async fn serve<I>(io: I, peer: SocketAddr, ctx: Arc<ServerContext>, shutdown: ShutdownSignal)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let summary = ServerConnectionHandler::new(io, Some(peer), ctx, shutdown)
        .run()
        .await;
    tracing::debug!(
        reason = %summary.reason,
        requests = summary.requests,
        body_bytes = summary.body_bytes_read,
        bytes_written = summary.bytes_written,
        lifetime_ms = summary.lifetime.as_millis() as u64,
        "Connection finished"
    );
}
