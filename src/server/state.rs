//! Per-connection state and close bookkeeping.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    HeaderReceived,
    RequestComplete,
    Responding,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, HeaderReceived)
                | (HeaderReceived, RequestComplete)
                | (RequestComplete, Responding)
                | (Responding, Idle)
                | (_, Closed)
        ) && self != Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::HeaderReceived => "HEADER_RECEIVED",
            ConnectionState::RequestComplete => "REQUEST_COMPLETE",
            ConnectionState::Responding => "RESPONDING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed between requests.
    PeerClosed,
    /// No new request within the idle timeout.
    IdleTimeout,
    /// Head or body did not arrive within the read timeout.
    ReadTimeout,
    /// Declared body exceeded the configured maximum (413 sent).
    BodyTooLarge,
    /// Request head exceeded the configured maximum (431 sent).
    HeadTooLarge,
    /// Bytes of a new request arrived before the current one completed.
    Pipelining,
    /// No handler for the service (501 sent).
    NoHandler,
    /// Malformed head or body framing.
    ProtocolViolation(String),
    /// Upgrade requested but refused (426 sent).
    UpgradeRejected,
    /// Handed over to the duplex handler, which has since ended.
    Upgraded,
    /// Peer asked for close, or HTTP/1.0 without keep-alive.
    ConnectionClose,
    /// Served the configured number of requests.
    KeepaliveExhausted,
    /// Server shutting down.
    Shutdown,
    Io(String),
}

impl CloseReason {
    /// Closed because the peer broke the protocol.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            CloseReason::Pipelining | CloseReason::ProtocolViolation(_) | CloseReason::HeadTooLarge
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            CloseReason::Io(detail) => write!(f, "io error: {detail}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Mutable per-connection bookkeeping.
#[derive(Debug)]
pub(crate) struct ConnectionStats {
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) state: ConnectionState,
    pub(crate) requests: u32,
    pub(crate) body_bytes_read: u64,
    pub(crate) bytes_written: u64,
    pub(crate) opened_at: Instant,
}

impl ConnectionStats {
    pub(crate) fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            state: ConnectionState::Idle,
            requests: 0,
            body_bytes_read: 0,
            bytes_written: 0,
            opened_at: Instant::now(),
        }
    }

    /// Step to `next`, logging illegal transitions instead of taking them.
    pub(crate) fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition(next) {
            tracing::error!(from = %self.state, to = %next, "Illegal connection state transition");
            return false;
        }
        tracing::trace!(from = %self.state, to = %next, "Connection state");
        self.state = next;
        true
    }

    pub(crate) fn summary(&self, reason: CloseReason) -> ConnectionSummary {
        ConnectionSummary {
            reason,
            requests: self.requests,
            body_bytes_read: self.body_bytes_read,
            bytes_written: self.bytes_written,
            lifetime: self.opened_at.elapsed(),
        }
    }
}

/// What happened on a connection, returned when it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub reason: CloseReason,
    /// Requests that received a handler response.
    pub requests: u32,
    /// Request body bytes consumed, across all requests.
    pub body_bytes_read: u64,
    pub bytes_written: u64,
    pub lifetime: Duration,
}

/// Bytes moved per second over one exchange.
pub(crate) fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        bytes as f64
    } else {
        bytes as f64 / secs
    }
}
