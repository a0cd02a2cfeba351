//! Per-connection request lifecycle.
//!
//! # States
//! ```text
//! IDLE ──head──▶ HEADER_RECEIVED ──body──▶ REQUEST_COMPLETE ──dispatch──▶ RESPONDING ──▶ IDLE
//!   │                                                                               └──▶ CLOSED
//!   ├─ idle timer fires / peer closes / shutdown ─────────────────────────────────────▶ CLOSED
//!   ├─ declared body > max_body_bytes ─── 413 ────────────────────────────────────────▶ CLOSED
//!   └─ upgrade request ─── 101 ──▶ duplex handler
//! ```
//!
//! Only one request is in flight per connection. Bytes of a further request
//! arriving before the current response is written close the connection; the
//! handler never sees that request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, UPGRADE};
use hyper::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::rpc::headers::X_REQUEST_ID;
use crate::rpc::{JsonCodec, PayloadCodec, RpcHead};
use crate::server::http1::{self, BodyFraming, ChunkProgress, ChunkedDecoder, RequestHead};
use crate::server::registry::{CallContext, HandlerRegistry};
use crate::server::state::{throughput, CloseReason, ConnectionState, ConnectionStats, ConnectionSummary};
use crate::server::upgrade;

/// How long a closing connection may take to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Everything connections of one server share.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: HandlerRegistry,
    pub codec: Arc<dyn PayloadCodec>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, registry: HandlerRegistry) -> Self {
        Self {
            config,
            registry,
            codec: Arc::new(JsonCodec),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

/// What to do after one exchange.
enum Step {
    Continue,
    Close(CloseReason),
}

/// Drives one accepted connection until it closes.
pub struct ServerConnectionHandler<I> {
    io: I,
    buf: BytesMut,
    ctx: Arc<ServerContext>,
    stats: ConnectionStats,
    shutdown: ShutdownSignal,
}

impl<I> ServerConnectionHandler<I>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: I, peer: Option<SocketAddr>, ctx: Arc<ServerContext>, shutdown: ShutdownSignal) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(8 * 1024),
            ctx,
            stats: ConnectionStats::new(peer),
            shutdown,
        }
    }

    /// Serve requests until the connection closes.
    pub async fn run(mut self) -> ConnectionSummary {
        loop {
            if let Err(reason) = self.await_request().await {
                return self.finish(reason).await;
            }
            let head = match self.read_head().await {
                Ok(head) => head,
                Err(reason) => return self.finish(reason).await,
            };
            if head.is_upgrade() {
                return self.upgrade(head).await;
            }
            match self.serve(head).await {
                Step::Continue => {}
                Step::Close(reason) => return self.finish(reason).await,
            }
        }
    }

    /// IDLE: wait for the first bytes of the next head with the idle timer armed.
    async fn await_request(&mut self) -> Result<(), CloseReason> {
        if !self.buf.is_empty() {
            return Ok(());
        }
        if self.shutdown.is_triggered() {
            return Err(CloseReason::Shutdown);
        }
        let idle = self.ctx.config.idle_timeout();
        tokio::select! {
            _ = self.shutdown.recv() => Err(CloseReason::Shutdown),
            read = tokio::time::timeout(idle, self.io.read_buf(&mut self.buf)) => match read {
                Err(_) => Err(CloseReason::IdleTimeout),
                Ok(Ok(0)) => Err(CloseReason::PeerClosed),
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(CloseReason::Io(e.to_string())),
            },
        }
    }

    async fn read_head(&mut self) -> Result<RequestHead, CloseReason> {
        let deadline = Instant::now() + self.ctx.config.read_timeout();
        let max = self.ctx.config.max_header_bytes;
        loop {
            match RequestHead::parse(&self.buf) {
                Ok(Some((head, consumed))) => {
                    if consumed > max {
                        self.reject(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, "request head too large")
                            .await;
                        return Err(CloseReason::HeadTooLarge);
                    }
                    self.buf.advance(consumed);
                    return Ok(head);
                }
                Ok(None) if self.buf.len() > max => {
                    self.reject(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, "request head too large")
                        .await;
                    return Err(CloseReason::HeadTooLarge);
                }
                Ok(None) => self.fill(deadline).await?,
                Err(e) => {
                    self.reject(StatusCode::BAD_REQUEST, "malformed request head").await;
                    return Err(CloseReason::ProtocolViolation(e.to_string()));
                }
            }
        }
    }

    /// One request/response exchange, starting in IDLE with a parsed head.
    async fn serve(&mut self, head: RequestHead) -> Step {
        let started = Instant::now();

        let framing = match head.framing() {
            Ok(framing) => framing,
            Err(e) => {
                self.reject(StatusCode::BAD_REQUEST, "invalid body framing").await;
                return Step::Close(CloseReason::ProtocolViolation(e.to_string()));
            }
        };
        if let BodyFraming::Length(declared) = framing {
            if declared > self.ctx.config.max_body_bytes as u64 {
                tracing::debug!(
                    declared,
                    max = self.ctx.config.max_body_bytes,
                    "Request body too large"
                );
                self.reject(StatusCode::PAYLOAD_TOO_LARGE, "request body too large").await;
                return Step::Close(CloseReason::BodyTooLarge);
            }
        }

        self.stats.transition(ConnectionState::HeaderReceived);
        let body = match self.read_body(framing).await {
            Ok(body) => body,
            Err(reason) => return Step::Close(reason),
        };
        self.stats.transition(ConnectionState::RequestComplete);

        if !self.buf.is_empty() {
            tracing::warn!(
                peer = ?self.stats.peer,
                buffered = self.buf.len(),
                "Pipelined request before response, closing"
            );
            return Step::Close(CloseReason::Pipelining);
        }

        let rpc_head = match RpcHead::from_parts(&head.method, &head.path, &head.headers) {
            Ok(rpc_head) => rpc_head,
            Err(e) => {
                return self
                    .answer(&head, StatusCode::BAD_REQUEST, e.to_string().into_bytes(), "text/plain", started, body.len())
                    .await;
            }
        };
        let service = rpc_head.service.clone();

        if self.ctx.config.debug {
            tracing::debug!(
                service = %service,
                channel = %rpc_head.channel,
                request_id = rpc_head.request_id.as_deref().unwrap_or_default(),
                headers = ?head.headers,
                body_bytes = body.len(),
                "Request received"
            );
        }

        let Some(handler) = self.ctx.registry.resolve(&service) else {
            tracing::debug!(service = %service, "No handler resolved");
            metrics::record_server_request(&service, StatusCode::NOT_IMPLEMENTED.as_u16());
            self.reject(StatusCode::NOT_IMPLEMENTED, &format!("no handler for '{service}'"))
                .await;
            return Step::Close(CloseReason::NoHandler);
        };

        let request = match self.ctx.codec.decode_request(&rpc_head, &body) {
            Ok(request) => request,
            Err(e) => {
                metrics::record_server_request(&service, StatusCode::BAD_REQUEST.as_u16());
                return self
                    .answer(&head, StatusCode::BAD_REQUEST, e.to_string().into_bytes(), "text/plain", started, body.len())
                    .await;
            }
        };

        let request_id = rpc_head.request_id.clone();
        let call = CallContext {
            head: rpc_head,
            peer: self.stats.peer,
            push: None,
        };
        let dispatch = async move { handler.handle(&call, request).await };
        tokio::pin!(dispatch);

        // Watch the socket while the handler runs: any byte now is a new request.
        let mut peer_eof = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut dispatch => break outcome,
                read = self.io.read_buf(&mut self.buf), if !peer_eof => match read {
                    Ok(0) => peer_eof = true,
                    Ok(_) => {
                        tracing::warn!(peer = ?self.stats.peer, service = %service, "Pipelined request during dispatch, closing");
                        return Step::Close(CloseReason::Pipelining);
                    }
                    Err(e) => return Step::Close(CloseReason::Io(e.to_string())),
                },
            }
        };

        let (status, payload, content_type) = match outcome {
            Ok(response) => {
                let mut out = Vec::new();
                match self.ctx.codec.encode_response(&response, &mut out) {
                    Ok(()) => (StatusCode::OK, out, self.ctx.codec.content_type()),
                    Err(e) => {
                        tracing::error!(service = %service, error = %e, "Failed to encode response");
                        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes(), "text/plain")
                    }
                }
            }
            Err(e) => {
                tracing::debug!(service = %service, error = %e, "Handler failed");
                (e.status(), e.to_string().into_bytes(), "text/plain")
            }
        };

        self.stats.requests += 1;
        metrics::record_server_request(&service, status.as_u16());

        let mut headers = content_headers(content_type);
        if let Some(id) = request_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
            headers.insert(X_REQUEST_ID, id);
        }
        let close = self.close_after(&head, peer_eof);
        self.respond_in_cycle(status, headers, payload, close, started, body.len())
            .await
    }

    /// Answer a request the handler never sees; the connection stays usable.
    async fn answer(
        &mut self,
        head: &RequestHead,
        status: StatusCode,
        payload: Vec<u8>,
        content_type: &str,
        started: Instant,
        body_len: usize,
    ) -> Step {
        let close = self.close_after(head, false);
        self.respond_in_cycle(status, content_headers(content_type), payload, close, started, body_len)
            .await
    }

    /// RESPONDING → write → IDLE, or CLOSED when `close` is set.
    async fn respond_in_cycle(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        payload: Vec<u8>,
        close: Option<CloseReason>,
        started: Instant,
        body_len: usize,
    ) -> Step {
        self.stats.transition(ConnectionState::Responding);
        if let Err(reason) = self.respond(status, &headers, &payload, close.is_none()).await {
            return Step::Close(reason);
        }

        let moved = (body_len + payload.len()) as u64;
        let rate = throughput(moved, started.elapsed());
        metrics::record_throughput(rate);
        if self.ctx.config.debug {
            tracing::debug!(
                status = status.as_u16(),
                response_bytes = payload.len(),
                bytes_per_second = rate as u64,
                "Response sent"
            );
        }

        match close {
            Some(reason) => Step::Close(reason),
            None => {
                self.stats.transition(ConnectionState::Idle);
                Step::Continue
            }
        }
    }

    /// Whether this response must be the last on the connection.
    fn close_after(&self, head: &RequestHead, peer_eof: bool) -> Option<CloseReason> {
        let limit = self.ctx.config.keepalive_requests;
        if head.wants_close() || peer_eof {
            Some(CloseReason::ConnectionClose)
        } else if limit > 0 && self.stats.requests >= limit {
            Some(CloseReason::KeepaliveExhausted)
        } else if self.shutdown.is_triggered() {
            Some(CloseReason::Shutdown)
        } else {
            None
        }
    }

    async fn read_body(&mut self, framing: BodyFraming) -> Result<Vec<u8>, CloseReason> {
        let deadline = Instant::now() + self.ctx.config.read_timeout();
        let max = self.ctx.config.max_body_bytes;

        let body = match framing {
            BodyFraming::Empty => Vec::new(),
            BodyFraming::Length(len) => {
                let len = len as usize;
                while self.buf.len() < len {
                    self.fill(deadline).await?;
                }
                self.buf.split_to(len).to_vec()
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::default();
                let mut out = Vec::new();
                loop {
                    match decoder.decode(&mut self.buf, &mut out) {
                        Ok(ChunkProgress::Done) => break,
                        Ok(ChunkProgress::NeedMore) => {}
                        Err(e) => {
                            self.reject(StatusCode::BAD_REQUEST, "malformed chunked body").await;
                            return Err(CloseReason::ProtocolViolation(e.to_string()));
                        }
                    }
                    if out.len() > max {
                        self.reject(StatusCode::PAYLOAD_TOO_LARGE, "request body too large").await;
                        return Err(CloseReason::BodyTooLarge);
                    }
                    self.fill(deadline).await?;
                }
                if out.len() > max {
                    self.reject(StatusCode::PAYLOAD_TOO_LARGE, "request body too large").await;
                    return Err(CloseReason::BodyTooLarge);
                }
                out
            }
        };
        self.stats.body_bytes_read += body.len() as u64;
        Ok(body)
    }

    /// Read more bytes mid-request.
    async fn fill(&mut self, deadline: Instant) -> Result<(), CloseReason> {
        match tokio::time::timeout_at(deadline, self.io.read_buf(&mut self.buf)).await {
            Err(_) => Err(CloseReason::ReadTimeout),
            Ok(Ok(0)) => Err(CloseReason::ProtocolViolation("connection closed mid-request".into())),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(CloseReason::Io(e.to_string())),
        }
    }

    async fn respond(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
        keep_alive: bool,
    ) -> Result<(), CloseReason> {
        let bytes = http1::encode_response(status, headers, body, keep_alive);
        self.io
            .write_all(&bytes)
            .await
            .map_err(|e| CloseReason::Io(e.to_string()))?;
        self.io.flush().await.map_err(|e| CloseReason::Io(e.to_string()))?;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Best-effort error response before closing.
    async fn reject(&mut self, status: StatusCode, message: &str) {
        let headers = content_headers("text/plain");
        if let Err(reason) = self.respond(status, &headers, message.as_bytes(), false).await {
            tracing::debug!(status = status.as_u16(), reason = %reason, "Failed to send error response");
        }
    }

    async fn upgrade(mut self, head: RequestHead) -> ConnectionSummary {
        let headers = match upgrade::accept_websocket(&head) {
            Ok(headers) => headers,
            Err(why) => {
                tracing::debug!(reason = why, "Upgrade refused");
                let mut headers = content_headers("text/plain");
                headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
                if let Err(reason) = self
                    .respond(StatusCode::UPGRADE_REQUIRED, &headers, why.as_bytes(), false)
                    .await
                {
                    return self.finish(reason).await;
                }
                return self.finish(CloseReason::UpgradeRejected).await;
            }
        };

        if let Err(reason) = self.respond(StatusCode::SWITCHING_PROTOCOLS, &headers, b"", true).await {
            return self.finish(reason).await;
        }
        tracing::debug!(peer = ?self.stats.peer, path = %head.path, "Switched to duplex channel");

        self.stats.transition(ConnectionState::Closed);
        let Self {
            io,
            buf,
            ctx,
            stats,
            shutdown,
        } = self;
        let reason = upgrade::serve_duplex(io, buf, stats.peer, ctx, shutdown).await;
        stats.summary(reason)
    }

    async fn finish(mut self, reason: CloseReason) -> ConnectionSummary {
        self.stats.transition(ConnectionState::Closed);
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.io.shutdown()).await;

        if reason.is_violation() {
            tracing::warn!(peer = ?self.stats.peer, reason = %reason, "Connection closed on protocol violation");
        } else {
            tracing::debug!(
                peer = ?self.stats.peer,
                reason = %reason,
                requests = self.stats.requests,
                "Connection closed"
            );
        }
        self.stats.summary(reason)
    }
}

fn content_headers(content_type: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("{content_type}; charset=utf-8")) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers
}
