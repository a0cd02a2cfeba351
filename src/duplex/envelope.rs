//! JSON framing for messages on a duplex channel.
//!
//! ```text
//! {"id": 7, "type": "request", "service": "quotes.watch", "channel": "DIRECT", "args": {...}}
//! {"id": 7, "type": "response", "value": {...}}
//! {"id": 7, "type": "error", "status": 501, "message": "no handler for 'quotes.watch'"}
//! ```
//!
//! Ids are chosen by the side that sends the request and echoed in the reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::{ChannelKind, CodecError, RpcRequest, RpcResponse, TransportError, Verb};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EnvelopeBody {
    Request {
        service: String,
        #[serde(default)]
        verb: Verb,
        #[serde(default)]
        channel: ChannelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access: Option<String>,
        #[serde(default)]
        args: Value,
    },
    Response {
        #[serde(default)]
        value: Value,
    },
    Error {
        status: u16,
        message: String,
    },
}

impl Envelope {
    pub fn request(id: u64, request: &RpcRequest) -> Self {
        Self {
            id,
            body: EnvelopeBody::Request {
                service: request.service.clone(),
                verb: request.verb,
                channel: request.channel,
                access: request.access.clone(),
                args: request.args.clone(),
            },
        }
    }

    pub fn response(id: u64, response: RpcResponse) -> Self {
        Self {
            id,
            body: EnvelopeBody::Response { value: response.value },
        }
    }

    pub fn error(id: u64, status: u16, message: impl Into<String>) -> Self {
        Self {
            id,
            body: EnvelopeBody::Error {
                status,
                message: message.into(),
            },
        }
    }

    /// The request carried by this envelope, if it is one.
    pub fn to_request(&self) -> Option<RpcRequest> {
        match &self.body {
            EnvelopeBody::Request {
                service,
                verb,
                channel,
                access,
                args,
            } => Some(RpcRequest {
                service: service.clone(),
                verb: *verb,
                channel: *channel,
                access: access.clone(),
                args: args.clone(),
            }),
            _ => None,
        }
    }

    /// Reply outcome carried by a response or error envelope.
    pub fn into_outcome(self) -> Option<Result<RpcResponse, TransportError>> {
        match self.body {
            EnvelopeBody::Response { value } => Some(Ok(RpcResponse::new(value))),
            EnvelopeBody::Error { status, message } => Some(Err(TransportError::Status { status, message })),
            EnvelopeBody::Request { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    pub fn decode(input: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(input).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let request = RpcRequest::new("quotes.watch")
            .with_channel(ChannelKind::NotifyBroadcast)
            .with_args(json!({"symbol": "ACME"}));
        let encoded = Envelope::request(7, &request).encode().unwrap();
        let wire: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(wire["id"], 7);
        assert_eq!(wire["type"], "request");
        assert_eq!(wire["service"], "quotes.watch");
        assert_eq!(wire["channel"], "NOTIFY+BROADCAST");
        assert_eq!(wire["verb"], "POST");
        assert!(wire.get("access").is_none());
    }

    #[test]
    fn decoded_request_matches_original() {
        let request = RpcRequest::new("audit.write")
            .with_verb(Verb::Put)
            .with_access("svc-1")
            .with_args(json!([1, 2]));
        let encoded = Envelope::request(1, &request).encode().unwrap();
        let decoded = Envelope::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.to_request(), Some(request));
    }

    #[test]
    fn minimal_request_uses_defaults() {
        let decoded = Envelope::decode(br#"{"id":3,"type":"request","service":"ping"}"#).unwrap();
        let request = decoded.to_request().unwrap();
        assert_eq!(request.verb, Verb::Post);
        assert_eq!(request.channel, ChannelKind::Direct);
        assert_eq!(request.args, Value::Null);
    }

    #[test]
    fn error_envelope_becomes_status_error() {
        let outcome = Envelope::error(9, 501, "nope").into_outcome().unwrap();
        assert!(matches!(outcome, Err(TransportError::Status { status: 501, .. })));
        assert!(Envelope::decode(b"{\"id\":1,\"type\":\"bogus\"}").is_err());
    }
}
