//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the RPC transport.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Client-side pooling and timeouts.
    pub client: ClientConfig,

    /// Server-side listener and per-connection limits.
    pub server: ServerConfig,

    /// Duplex keepalive sessions.
    pub keepalive: KeepaliveConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Client transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds an idle pooled connection is kept before it is closed.
    pub idle_timeout_secs: u64,

    /// Soft cap on idle + in-flight connections per endpoint.
    pub fine_connections: usize,

    /// Maximum request/response cycles on one connection.
    pub keepalive_requests: u32,

    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Time allowed for the response after the request is sent, in milliseconds.
    pub read_timeout_ms: u64,

    /// How long `acquire` waits for a free connection at the cap, in milliseconds.
    pub acquire_wait_ms: u64,

    /// Log headers and payload sizes of every call.
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            fine_connections: 32,
            keepalive_requests: 100,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 10_000,
            acquire_wait_ms: 100,
            debug: false,
        }
    }
}

impl ClientConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:7700").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Seconds a connection may sit idle between requests.
    pub idle_timeout_secs: u64,

    /// Time allowed to receive a request body, in milliseconds.
    pub read_timeout_ms: u64,

    /// Largest accepted request body in bytes.
    pub max_body_bytes: usize,

    /// Largest accepted request head in bytes.
    pub max_header_bytes: usize,

    /// Requests served per connection before it is closed (0 = unlimited).
    pub keepalive_requests: u32,

    /// Seconds to wait for open connections on shutdown.
    pub drain_timeout_secs: u64,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Log request heads and payload sizes.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7700".to_string(),
            max_connections: 10_000,
            idle_timeout_secs: 60,
            read_timeout_ms: 10_000,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            max_header_bytes: 16 * 1024,
            keepalive_requests: 0,
            drain_timeout_secs: 10,
            tls: None,
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Duplex keepalive configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Fixed delay between reconnect attempts in seconds.
    pub retry_interval_secs: u64,

    /// Time allowed for a reply on the duplex channel, in milliseconds.
    pub request_timeout_ms: u64,

    /// Handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 60,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl KeepaliveConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = TransportConfig::default();
        assert_eq!(config.client.acquire_wait(), Duration::from_millis(100));
        assert_eq!(config.keepalive.retry_interval(), Duration::from_secs(60));
        assert_eq!(config.server.max_body_bytes, 2 * 1024 * 1024);
        assert!(config.server.tls.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: TransportConfig = toml::from_str(
            r#"
            [client]
            fine_connections = 4
            keepalive_requests = 3

            [server]
            bind_address = "127.0.0.1:0"
            "#,
        )
        .unwrap();

        assert_eq!(config.client.fine_connections, 4);
        assert_eq!(config.client.keepalive_requests, 3);
        assert_eq!(config.client.idle_timeout_secs, 60);
        assert_eq!(config.server.bind_address, "127.0.0.1:0");
        assert_eq!(config.server.max_header_bytes, 16 * 1024);
    }
}
