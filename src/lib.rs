//! RPC transport over HTTP/1.1.
//!
//! # Architecture Overview
//!
//! ```text
//!  caller                                                       remote node
//!  ──────                                                       ───────────
//!  ServiceInvoker ─▶ ClientTransport ─▶ ConnectionPool ─▶ HTTP/1.1 ─▶ RpcServer
//!   (blocking or       (encode, send,     (idle reuse,               │
//!    listener)          timeouts)          soft cap,                 ▼
//!                                          idle expiry)     ServerConnectionHandler
//!                                                             (IDLE → … → IDLE)
//!                                                                    │ 101
//!  KeepaliveSession ◀──────── duplex WebSocket channel ◀─────────────┘
//!   (fixed-interval reconnect)
//! ```
//!
//! Cross-cutting: `config` (TOML), `observability` (tracing + metrics),
//! `lifecycle` (graceful shutdown), `resilience` (timeouts, retry policy).

// Wire contract
pub mod rpc;

// Client side
pub mod client;
pub mod pool;

// Server side
pub mod net;
pub mod server;

// Duplex channels
pub mod duplex;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use client::{ClientTransport, InvocationHandle, RequestContext, ResponseListener, ServiceInvoker};
pub use config::TransportConfig;
pub use duplex::KeepaliveSession;
pub use lifecycle::Shutdown;
pub use pool::ConnectionPool;
pub use rpc::{ChannelKind, Endpoint, RpcRequest, RpcResponse, TransportError, TransportResult, Verb};
pub use server::{HandlerRegistry, RpcServer};
