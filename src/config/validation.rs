//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, caps >= 1)
//! - Check addresses parse before anything binds
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::TransportConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is not a valid socket address: '{value}'")]
    Address { field: &'static str, value: String },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let client = &config.client;
    non_zero(&mut errors, "client.idle_timeout_secs", client.idle_timeout_secs);
    non_zero(&mut errors, "client.fine_connections", client.fine_connections as u64);
    non_zero(&mut errors, "client.keepalive_requests", client.keepalive_requests as u64);
    non_zero(&mut errors, "client.connect_timeout_ms", client.connect_timeout_ms);
    non_zero(&mut errors, "client.read_timeout_ms", client.read_timeout_ms);

    let server = &config.server;
    address(&mut errors, "server.bind_address", &server.bind_address);
    non_zero(&mut errors, "server.max_connections", server.max_connections as u64);
    non_zero(&mut errors, "server.idle_timeout_secs", server.idle_timeout_secs);
    non_zero(&mut errors, "server.read_timeout_ms", server.read_timeout_ms);
    non_zero(&mut errors, "server.max_body_bytes", server.max_body_bytes as u64);
    non_zero(&mut errors, "server.max_header_bytes", server.max_header_bytes as u64);
    if let Some(tls) = &server.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::Empty { field: "server.tls.cert_path" });
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::Empty { field: "server.tls.key_path" });
        }
    }

    let keepalive = &config.keepalive;
    non_zero(&mut errors, "keepalive.retry_interval_secs", keepalive.retry_interval_secs);
    non_zero(&mut errors, "keepalive.request_timeout_ms", keepalive.request_timeout_ms);
    non_zero(&mut errors, "keepalive.connect_timeout_ms", keepalive.connect_timeout_ms);

    if config.observability.metrics_enabled {
        address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn non_zero(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero { field });
    }
}

fn address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::Address {
            field,
            value: value.to_string(),
        });
    }
}
