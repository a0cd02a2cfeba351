//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (structured fields: endpoint, connection_id, service)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → logging.rs (fmt subscriber with env filter)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Request ID flows from client header into server spans
//! - Metrics are cheap (atomic increments behind the `metrics` facade)
//! - Without an installed recorder every metric call is a no-op

pub mod logging;
pub mod metrics;
