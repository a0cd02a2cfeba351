//! Client connection pooling.
//!
//! # Data Flow
//! ```text
//! acquire(endpoint)
//!     → idle connection?   → Checkout::Reused(lease)   (expiry timer cancelled)
//!     → below soft cap?    → Checkout::Open(ticket)
//!     → at cap             → wait up to acquire_wait, then Open anyway
//!
//! lease.release()  → uses < keepalive_requests ? park + arm idle timer : close
//! lease.discard()  → close, free slot
//! idle timer fires → close if still parked under the same token
//! ```
//!
//! Each endpoint keeps `idle + pending` under one mutex. The cap is soft:
//! when nothing frees up within `acquire_wait`, a connection is opened anyway.

mod lease;
mod manager;
mod slot;

use std::time::Duration;

use crate::config::ClientConfig;
use crate::net::ConnectionId;

pub use lease::{Checkout, Lease, Ticket};
pub use manager::ConnectionPool;

/// A connection the pool can hold.
///
/// Dropping the value closes the connection.
pub trait Poolable: Send + 'static {
    fn id(&self) -> ConnectionId;

    /// False once the underlying channel is known to be unusable.
    fn is_open(&self) -> bool;
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub idle_timeout: Duration,
    pub fine_connections: usize,
    pub keepalive_requests: u32,
    pub acquire_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            fine_connections: config.fine_connections,
            keepalive_requests: config.keepalive_requests,
            acquire_wait: config.acquire_wait(),
        }
    }
}

/// Point-in-time view of one endpoint's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub pending: usize,
    pub created: u64,
    pub reused: u64,
    pub expired: u64,
    pub discarded: u64,
}
