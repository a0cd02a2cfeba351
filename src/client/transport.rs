//! Pooled request/response exchange.
//!
//! # Responsibilities
//! - Check a connection out of the pool, opening one when told to
//! - Encode the request, send it, read the whole response within the read timeout
//! - Decide the connection's fate: released, retired or discarded
//! - Map every failure into `TransportError`

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, HOST};
use hyper::http::response::Parts;
use hyper::{Request, StatusCode};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::client::connector::{HttpConnection, HttpConnector};
use crate::client::listener::{Delivery, InvocationHandle, ResponseListener};
use crate::config::ClientConfig;
use crate::observability::metrics;
use crate::pool::{Checkout, ConnectionPool, Lease, PoolConfig};
use crate::rpc::{
    Endpoint, JsonCodec, PayloadCodec, RpcHead, RpcRequest, RpcResponse, TransportError, TransportResult,
};

/// Longest error body echoed into `TransportError::Status`.
const MAX_STATUS_MESSAGE: usize = 512;

/// One call: what to send and where.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub endpoint: Endpoint,
    pub request: RpcRequest,
    /// Overrides the configured read timeout.
    pub deadline: Option<Duration>,
}

impl RequestContext {
    pub fn new(endpoint: Endpoint, request: RpcRequest) -> Self {
        Self {
            endpoint,
            request,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Client side of the transport. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct ClientTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    config: ClientConfig,
    pool: ConnectionPool<HttpConnection>,
    connector: HttpConnector,
    codec: Arc<dyn PayloadCodec>,
    runtime: Handle,
}

impl ClientTransport {
    /// JSON bodies, default TLS roots.
    pub fn new(config: ClientConfig, runtime: Handle) -> Self {
        let connector = HttpConnector::new(config.connect_timeout());
        Self::with_parts(config, runtime, connector, Arc::new(JsonCodec))
    }

    pub fn with_parts(
        config: ClientConfig,
        runtime: Handle,
        connector: HttpConnector,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        let pool = ConnectionPool::new(PoolConfig::from(&config));
        Self {
            inner: Arc::new(TransportInner {
                config,
                pool,
                connector,
                codec,
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool<HttpConnection> {
        &self.inner.pool
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Start `ctx` on the runtime and report its outcome to `listener`.
    pub fn invoke(&self, ctx: RequestContext, listener: Arc<dyn ResponseListener>) -> InvocationHandle {
        let delivery = Delivery::new(listener);
        let state = delivery.state();
        let transport = self.clone();
        let task = self.inner.runtime.spawn(async move {
            let outcome = match AssertUnwindSafe(transport.execute(ctx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(reason = %reason, "Invocation panicked");
                    Err(TransportError::Aborted(reason))
                }
            };
            delivery.deliver(outcome);
        });
        InvocationHandle::new(state, task)
    }

    /// Perform one call and return its decoded response.
    pub async fn execute(&self, ctx: RequestContext) -> TransportResult<RpcResponse> {
        let start = Instant::now();
        let service = ctx.request.service.clone();
        let result = self.exchange(ctx).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_invocation(&service, outcome, start);
        if let Err(e) = &result {
            tracing::debug!(
                service = %service,
                error = %e,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Invocation failed"
            );
        }
        result
    }

    async fn exchange(&self, ctx: RequestContext) -> TransportResult<RpcResponse> {
        let inner = &self.inner;
        let RequestContext {
            endpoint,
            request,
            deadline,
        } = ctx;

        let head = RpcHead::for_request(&request, inner.codec.content_type())
            .with_request_id(Uuid::new_v4().to_string());

        let mut lease = self.checkout(&endpoint).await?;

        let mut body = Vec::new();
        if let Err(e) = inner.codec.encode_request(&request, &mut body) {
            // Nothing written, but the exchange on this connection is abandoned.
            lease.discard();
            return Err(TransportError::EncodeFailure(e));
        }
        let http_request = match build_request(&endpoint, &head, body) {
            Ok(r) => r,
            Err(e) => {
                lease.discard();
                return Err(e);
            }
        };

        if inner.config.debug {
            tracing::debug!(
                endpoint = %endpoint,
                connection_id = %lease.id(),
                service = %head.service,
                channel = %head.channel,
                request_id = head.request_id.as_deref().unwrap_or_default(),
                headers = ?http_request.headers(),
                body_bytes = http_request.body().size_hint().exact().unwrap_or_default(),
                "Sending request"
            );
        }

        let read_timeout = deadline.unwrap_or_else(|| inner.config.read_timeout());
        let outcome = tokio::time::timeout(read_timeout, round_trip(&mut lease, http_request)).await;
        let (parts, bytes) = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                lease.discard();
                return Err(TransportError::ChannelLost(e.to_string()));
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    connection_id = %lease.id(),
                    service = %head.service,
                    timeout_ms = read_timeout.as_millis() as u64,
                    "No response within read timeout, discarding connection"
                );
                lease.discard();
                return Err(TransportError::Timeout(read_timeout));
            }
        };

        // Response fully read; the connection may be reused.
        lease.release();

        if inner.config.debug {
            tracing::debug!(
                endpoint = %endpoint,
                service = %head.service,
                status = parts.status.as_u16(),
                headers = ?parts.headers,
                body_bytes = bytes.len(),
                "Received response"
            );
        }

        if parts.status != StatusCode::OK {
            return Err(status_error(parts.status, &bytes));
        }

        let response_head = head.for_response(&parts.headers);
        inner
            .codec
            .decode_response(&response_head, &bytes, &head.service)
            .map_err(TransportError::DecodeFailure)
    }

    /// A ready connection for `endpoint`.
    ///
    /// A pooled connection that turns out to be dead is discarded and the
    /// next one tried; a freshly opened one that is not ready is a connect
    /// failure.
    async fn checkout(&self, endpoint: &Endpoint) -> TransportResult<Lease<HttpConnection>> {
        loop {
            match self.inner.pool.acquire(endpoint).await {
                Checkout::Reused(mut lease) => match lease.ready().await {
                    Ok(()) => return Ok(lease),
                    Err(e) => {
                        tracing::debug!(
                            endpoint = %endpoint,
                            connection_id = %lease.id(),
                            error = %e,
                            "Pooled connection unusable, discarding"
                        );
                        lease.discard();
                    }
                },
                Checkout::Open(ticket) => {
                    let pool = self.inner.pool.clone();
                    let lost_endpoint = endpoint.clone();
                    let conn = self
                        .inner
                        .connector
                        .connect(
                            endpoint,
                            Box::new(move |id| {
                                pool.connection_lost(&lost_endpoint, id);
                            }),
                        )
                        .await?;
                    let mut lease = ticket.fulfil(conn);
                    return match lease.ready().await {
                        Ok(()) => Ok(lease),
                        Err(e) => {
                            lease.discard();
                            Err(TransportError::connect(endpoint, e))
                        }
                    };
                }
            }
        }
    }
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

fn build_request(endpoint: &Endpoint, head: &RpcHead, body: Vec<u8>) -> TransportResult<Request<Full<Bytes>>> {
    let mut request = Request::builder()
        .method(head.verb.as_method())
        .uri(head.path())
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;

    let headers = request.headers_mut();
    let host = HeaderValue::from_str(&endpoint.authority())
        .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
    headers.insert(HOST, host);
    head.apply(headers)?;
    Ok(request)
}

async fn round_trip(
    conn: &mut HttpConnection,
    request: Request<Full<Bytes>>,
) -> Result<(Parts, Bytes), hyper::Error> {
    let response = conn.send(request).await?;
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();
    Ok((parts, bytes))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> TransportError {
    let text = String::from_utf8_lossy(body);
    let mut message: String = text.chars().take(MAX_STATUS_MESSAGE).collect();
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or_default().to_string();
    }
    TransportError::Status {
        status: status.as_u16(),
        message,
    }
}
