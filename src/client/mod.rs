//! Client transport subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceInvoker (service, verb, args)
//!     → RequestContext
//!     → ClientTransport::execute / invoke
//!         → pool::ConnectionPool::acquire
//!         → connector.rs (TCP/TLS + HTTP/1.1 handshake) when a ticket is issued
//!         → codec encode → send → read response under the read timeout
//!         → lease released, retired or discarded
//!     → Result, or ResponseListener success|fail + complete
//! ```
//!
//! # Design Decisions
//! - The async path is primary; the blocking call is a thin bridge on top
//! - A timed-out connection is never pooled again
//! - Non-200 responses are failures, whatever their body says

pub mod connector;
pub mod invoker;
pub mod listener;
pub mod transport;

pub use connector::{HttpConnection, HttpConnector};
pub use invoker::ServiceInvoker;
pub use listener::{InvocationHandle, ResponseListener};
pub use transport::{ClientTransport, RequestContext};
