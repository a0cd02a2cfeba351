//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → sections handed to pool, client, server and keepalive
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; each transport is built from a copy
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::ClientConfig;
pub use schema::KeepaliveConfig;
pub use schema::ObservabilityConfig;
pub use schema::ServerConfig;
pub use schema::TlsConfig;
pub use schema::TransportConfig;
pub use validation::ValidationError;
