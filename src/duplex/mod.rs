//! Duplex channels over WebSocket.
//!
//! # Data Flow
//! ```text
//! KeepaliveSession (keepalive.rs)
//!     → connector.rs (handshake, with connect timeout)
//!     → channel.rs (reader/writer pump tasks ⇄ mpsc queues)
//!     → envelope.rs (JSON frames: request | response | error)
//!
//! Server side: server::upgrade hands the upgraded socket to channel.rs
//! ```
//!
//! # Design Decisions
//! - Replies are matched to requests by envelope id
//! - One supervisor task per session; reconnects never overlap
//! - Calls fail fast while disconnected instead of queueing

pub mod channel;
pub mod connector;
pub mod envelope;
pub mod keepalive;

pub use channel::{DuplexChannel, Outbox};
pub use connector::{DuplexConnector, WsConnector};
pub use envelope::{Envelope, EnvelopeBody};
pub use keepalive::KeepaliveSession;
