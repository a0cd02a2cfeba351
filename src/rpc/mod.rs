//! Wire contract shared by the client and server halves.
//!
//! # Data Flow
//! ```text
//! RpcRequest (service, verb, channel, args)
//!     → headers.rs (RpcHead ⇄ x-rpc-* headers)
//!     → codec.rs (opaque body encode/decode)
//!     → HTTP/1.1 request on a pooled connection
//!
//! HTTP/1.1 response
//!     → status check (anything but 200 is a failure)
//!     → codec.rs decode → RpcResponse
//! ```
//!
//! # Design Decisions
//! - The body codec is a collaborator behind a trait; the transport never
//!   inspects payload bytes
//! - Channel kind travels as a header and is not interpreted here
//! - All failures collapse into one `TransportError` taxonomy

pub mod codec;
pub mod error;
pub mod headers;
pub mod types;

pub use codec::{CodecError, JsonCodec, PayloadCodec};
pub use error::{TransportError, TransportResult};
pub use headers::RpcHead;
pub use types::{ChannelKind, Endpoint, RpcRequest, RpcResponse, Verb};
