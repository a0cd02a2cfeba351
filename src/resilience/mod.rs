//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call over a channel:
//!     → timeouts.rs (every wait has a deadline, expiry maps to TransportError::Timeout)
//!
//! Lost duplex channel:
//!     → retries.rs (fixed-interval reconnect schedule, unbounded by default)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Reconnects are spaced by a constant interval, never in a tight loop
//! - Requests are never retried by the transport itself

pub mod retries;
pub mod timeouts;

pub use retries::RetryPolicy;
pub use timeouts::with_timeout;
