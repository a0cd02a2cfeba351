//! Payload codec contract.
//!
//! The transport treats request and response bodies as opaque bytes. A codec
//! turns an [`RpcRequest`] into a body and back, using the [`RpcHead`] for the
//! metadata that travels in headers.

use thiserror::Error;

use crate::rpc::headers::RpcHead;
use crate::rpc::types::{RpcRequest, RpcResponse};

/// Errors raised while encoding or decoding a body.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize: {0}")]
    Serialize(String),

    #[error("failed to deserialize: {0}")]
    Deserialize(String),

    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),
}

/// Encodes and decodes RPC bodies.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Media type written into the `content-type` header.
    fn content_type(&self) -> &'static str;

    /// Serialise the request arguments into `out`.
    fn encode_request(&self, request: &RpcRequest, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Rebuild a request from its head and body.
    fn decode_request(&self, head: &RpcHead, input: &[u8]) -> Result<RpcRequest, CodecError>;

    /// Serialise a response into `out`.
    fn encode_response(&self, response: &RpcResponse, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Rebuild a response for `service` from its head and body.
    fn decode_response(
        &self,
        head: &RpcHead,
        input: &[u8],
        service: &str,
    ) -> Result<RpcResponse, CodecError>;
}

/// JSON bodies via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn check_content_type(head: &RpcHead) -> Result<(), CodecError> {
        if head.content_type == "application/json" || head.content_type.ends_with("+json") {
            Ok(())
        } else {
            Err(CodecError::UnsupportedContentType(head.content_type.clone()))
        }
    }
}

impl PayloadCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode_request(&self, request: &RpcRequest, out: &mut Vec<u8>) -> Result<(), CodecError> {
        serde_json::to_writer(out, &request.args).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode_request(&self, head: &RpcHead, input: &[u8]) -> Result<RpcRequest, CodecError> {
        let args = if input.is_empty() {
            serde_json::Value::Null
        } else {
            Self::check_content_type(head)?;
            serde_json::from_slice(input).map_err(|e| CodecError::Deserialize(e.to_string()))?
        };

        Ok(RpcRequest {
            service: head.service.clone(),
            verb: head.verb,
            channel: head.channel,
            access: head.access.clone(),
            args,
        })
    }

    fn encode_response(&self, response: &RpcResponse, out: &mut Vec<u8>) -> Result<(), CodecError> {
        serde_json::to_writer(out, &response.value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode_response(
        &self,
        head: &RpcHead,
        input: &[u8],
        service: &str,
    ) -> Result<RpcResponse, CodecError> {
        if input.is_empty() {
            return Ok(RpcResponse::empty());
        }
        Self::check_content_type(head)?;
        let value = serde_json::from_slice(input)
            .map_err(|e| CodecError::Deserialize(format!("response of '{service}': {e}")))?;
        Ok(RpcResponse::new(value))
    }
}
