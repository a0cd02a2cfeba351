//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rpc_pool_checkouts_total` (counter): acquires by endpoint, outcome (reused/created)
//! - `rpc_pool_expired_total` (counter): idle connections closed by their timer
//! - `rpc_invocations_total` (counter): client calls by service, outcome
//! - `rpc_invocation_duration_seconds` (histogram): client latency
//! - `rpc_server_requests_total` (counter): served requests by service, status
//! - `rpc_server_throughput_bytes_per_second` (histogram): per completed response
//! - `rpc_server_active_connections` (gauge)
//! - `rpc_keepalive_connect_attempts_total` (counter): by url, outcome

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_pool_checkout(endpoint: &str, reused: bool) {
    let outcome = if reused { "reused" } else { "created" };
    counter!("rpc_pool_checkouts_total", "endpoint" => endpoint.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_pool_expired(endpoint: &str) {
    counter!("rpc_pool_expired_total", "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_invocation(service: &str, outcome: &'static str, start: Instant) {
    counter!("rpc_invocations_total", "service" => service.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("rpc_invocation_duration_seconds", "service" => service.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_server_request(service: &str, status: u16) {
    counter!(
        "rpc_server_requests_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_throughput(bytes_per_second: f64) {
    histogram!("rpc_server_throughput_bytes_per_second").record(bytes_per_second);
}

pub fn set_active_connections(count: u64) {
    gauge!("rpc_server_active_connections").set(count as f64);
}

pub fn record_keepalive_attempt(url: &str, connected: bool) {
    let outcome = if connected { "connected" } else { "failed" };
    counter!(
        "rpc_keepalive_connect_attempts_total",
        "url" => url.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
