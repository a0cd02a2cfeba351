//! Transport error taxonomy.

use std::time::Duration;
use thiserror::Error;

use crate::rpc::codec::CodecError;

/// Errors surfaced to callers through `fail()` or the synchronous result.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A connection to the endpoint could not be established.
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailure { endpoint: String, reason: String },

    /// Malformed header, illegal pipelining or an oversized body.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The request could not be serialised.
    #[error("encode failed: {0}")]
    EncodeFailure(#[source] CodecError),

    /// The response could not be deserialised.
    #[error("decode failed: {0}")]
    DecodeFailure(#[source] CodecError),

    /// No response arrived within the allowed time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The channel closed underneath an operation, or none is established.
    #[error("channel lost: {0}")]
    ChannelLost(String),

    /// The server answered with a status other than 200.
    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The endpoint address could not be understood.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The invocation was cancelled by the caller.
    #[error("invocation cancelled")]
    Cancelled,

    /// A blocking call was made from inside the async runtime.
    #[error("blocking invoke called from a runtime thread")]
    WouldBlock,

    /// The invocation task panicked before producing an outcome.
    #[error("invocation aborted: {0}")]
    Aborted(String),
}

impl TransportError {
    pub fn connect(endpoint: impl ToString, reason: impl ToString) -> Self {
        TransportError::ConnectFailure {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::ConnectFailure { .. } => "connect_failure",
            TransportError::ProtocolViolation(_) => "protocol_violation",
            TransportError::EncodeFailure(_) => "encode_failure",
            TransportError::DecodeFailure(_) => "decode_failure",
            TransportError::Timeout(_) => "timeout",
            TransportError::ChannelLost(_) => "channel_lost",
            TransportError::Status { .. } => "status",
            TransportError::InvalidEndpoint(_) => "invalid_endpoint",
            TransportError::Cancelled => "cancelled",
            TransportError::WouldBlock => "would_block",
            TransportError::Aborted(_) => "aborted",
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
