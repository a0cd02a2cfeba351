//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use rpc_transport::config::ServerConfig;
use rpc_transport::lifecycle::Shutdown;
use rpc_transport::net::Listener;
use rpc_transport::server::{ConnectionSummary, HandlerRegistry, RpcServer, ServerConnectionHandler, ServerContext};
use rpc_transport::Endpoint;

/// What the mock backend answers with.
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn json(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            body: serde_json::to_vec(&body).unwrap(),
            delay: None,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.as_bytes().to_vec(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A keep-alive HTTP/1.1 server built directly on hyper.
pub struct MockBackend {
    pub addr: SocketAddr,
    /// TCP connections accepted so far.
    pub connections: Arc<AtomicUsize>,
    /// Requests served so far.
    pub requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockBackend {
    /// Start a backend whose replies are computed from the request.
    pub async fn start<F, Fut>(respond: F) -> Self
    where
        F: Fn(hyper::http::request::Parts, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Reply> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);

        let accepted = Arc::clone(&connections);
        let served = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let respond = Arc::clone(&respond);
                let served = Arc::clone(&served);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let respond = Arc::clone(&respond);
                        let served = Arc::clone(&served);
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await?.to_bytes();
                            served.fetch_add(1, Ordering::SeqCst);
                            let reply = respond(parts, body).await;
                            if let Some(delay) = reply.delay {
                                tokio::time::sleep(delay).await;
                            }
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .status(StatusCode::from_u16(reply.status).unwrap())
                                    .header("content-type", "application/json; charset=utf-8")
                                    .body(Full::new(Bytes::from(reply.body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            connections,
            requests,
            task,
        }
    }

    /// Echo the request body back as the response.
    pub async fn echo() -> Self {
        Self::start(|_, body| async move {
            Reply {
                status: 200,
                body: body.to_vec(),
                delay: None,
            }
        })
        .await
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Server limits small enough for tests to hit.
pub fn test_server_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1:0".into(),
        idle_timeout_secs: 5,
        read_timeout_ms: 2_000,
        max_body_bytes: 1024,
        drain_timeout_secs: 2,
        ..ServerConfig::default()
    }
}

/// An `RpcServer` running on an ephemeral port.
pub struct Node {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

impl Node {
    pub async fn start(config: ServerConfig, registry: HandlerRegistry) -> Self {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::from_tcp(tcp, config.max_connections);
        let server = RpcServer::new(config, registry).unwrap();
        let shutdown = Shutdown::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                server.run(listener, shutdown).await.unwrap();
            })
        };
        Self { addr, shutdown, task }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/duplex", self.addr)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// One connection handler over an in-memory pipe.
///
/// Returns the client end and the task yielding the handler's summary.
pub fn spawn_connection(
    config: ServerConfig,
    registry: HandlerRegistry,
) -> (DuplexStream, JoinHandle<ConnectionSummary>, Shutdown) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let ctx = Arc::new(ServerContext::new(config, registry));
    let shutdown = Shutdown::new();
    let handler = ServerConnectionHandler::new(server, None, ctx, shutdown.signal());
    (client, tokio::spawn(handler.run()), shutdown)
}

/// A request as raw HTTP/1.1 bytes.
pub fn raw_request(service: &str, body: &str, extra_headers: &str) -> String {
    format!(
        "POST /{service} HTTP/1.1\r\nHost: test\r\nx-rpc-service: {service}\r\n\
         content-type: application/json\r\ncontent-length: {}\r\n{extra_headers}\r\n{body}",
        body.len()
    )
}

/// A response read back off a raw connection.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim().to_string())
        })
    }
}

/// Read one content-length framed response.
pub async fn read_response<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Option<RawResponse> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let status = head.split_whitespace().nth(1)?.parse().ok()?;
    let mut response = RawResponse {
        status,
        head,
        body: String::new(),
    };
    let length: usize = response
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    response.body = String::from_utf8_lossy(&buf[head_end..head_end + length]).to_string();
    Some(response)
}

/// Write raw bytes and flush.
pub async fn send_raw<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
}

/// Read until the peer closes; returns everything read.
pub async fn read_to_close<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    out
}
