//! Mapping between RPC call metadata and HTTP headers.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::Method;

use crate::rpc::error::TransportError;
use crate::rpc::types::{ChannelKind, RpcRequest, Verb};

pub const X_RPC_SERVICE: HeaderName = HeaderName::from_static("x-rpc-service");
pub const X_RPC_ACCESS: HeaderName = HeaderName::from_static("x-rpc-access");
pub const X_RPC_CHANNEL: HeaderName = HeaderName::from_static("x-rpc-channel");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const DEFAULT_CHARSET: &str = "utf-8";

/// Call metadata as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHead {
    pub service: String,
    pub verb: Verb,
    pub channel: ChannelKind,
    pub access: Option<String>,
    /// Media type without parameters, e.g. `application/json`.
    pub content_type: String,
    pub charset: String,
    pub request_id: Option<String>,
}

impl RpcHead {
    /// Metadata for an outgoing request encoded with `content_type`.
    pub fn for_request(request: &RpcRequest, content_type: &str) -> Self {
        Self {
            service: request.service.clone(),
            verb: request.verb,
            channel: request.channel,
            access: request.access.clone(),
            content_type: content_type.to_string(),
            charset: DEFAULT_CHARSET.to_string(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Request path derived from the service name.
    pub fn path(&self) -> String {
        format!("/{}", self.service)
    }

    /// Write the metadata into `headers`.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), TransportError> {
        headers.insert(X_RPC_SERVICE, header_value(&self.service)?);
        headers.insert(X_RPC_CHANNEL, HeaderValue::from_static(self.channel.as_str()));
        if let Some(access) = &self.access {
            headers.insert(X_RPC_ACCESS, header_value(access)?);
        }
        if let Some(id) = &self.request_id {
            headers.insert(X_REQUEST_ID, header_value(id)?);
        }
        headers.insert(
            CONTENT_TYPE,
            header_value(&format!("{}; charset={}", self.content_type, self.charset))?,
        );
        Ok(())
    }

    /// Metadata of the response to this request, taking the body encoding
    /// from the response headers.
    pub fn for_response(&self, headers: &HeaderMap) -> Self {
        let mut head = self.clone();
        if let Some((content_type, charset)) = header_str(headers, &CONTENT_TYPE).map(split_content_type) {
            head.content_type = content_type;
            head.charset = charset;
        }
        head
    }

    /// Rebuild metadata from an incoming request.
    ///
    /// The service header wins over the request path. A missing channel header
    /// means `DIRECT`.
    pub fn from_parts(method: &Method, path: &str, headers: &HeaderMap) -> Result<Self, TransportError> {
        let verb = Verb::from_method(method).ok_or_else(|| {
            TransportError::ProtocolViolation(format!("unsupported verb {method}"))
        })?;

        let service = match header_str(headers, &X_RPC_SERVICE) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => path
                .split('?')
                .next()
                .unwrap_or_default()
                .trim_matches('/')
                .to_string(),
        };

        let channel = match header_str(headers, &X_RPC_CHANNEL) {
            Some(raw) => raw.parse()?,
            None => ChannelKind::Direct,
        };

        let (content_type, charset) = header_str(headers, &CONTENT_TYPE)
            .map(split_content_type)
            .unwrap_or_else(|| ("application/octet-stream".to_string(), DEFAULT_CHARSET.to_string()));

        Ok(Self {
            service,
            verb,
            channel,
            access: header_str(headers, &X_RPC_ACCESS).map(str::to_string),
            content_type,
            charset,
            request_id: header_str(headers, &X_REQUEST_ID).map(str::to_string),
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|_| TransportError::ProtocolViolation(format!("invalid header value '{value}'")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Split `type/subtype; charset=x` into its media type and charset.
fn split_content_type(raw: &str) -> (String, String) {
    let mut parts = raw.split(';');
    let media = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let charset = parts
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, v)| v.trim().trim_matches('"').to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_CHARSET.to_string());
    (media, charset)
}
