//! Core RPC types: endpoints, requests, responses and channel kinds.

use hyper::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::rpc::error::TransportError;

/// A remote service instance, used as the connection pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Create a plain-text endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Create an endpoint reached over TLS.
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: true,
        }
    }

    /// Parse an `http://` or `https://` URL into an endpoint.
    ///
    /// The port falls back to the scheme default when absent.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;

        let tls = match parsed.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme '{other}' in {url}"
                )))
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{url}: missing host")))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{url}: missing port")))?;

        Ok(Self { host, port, tls })
    }

    /// `host:port` as used for the `Host` header and socket connects.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Request verb carried as the HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub fn as_method(&self) -> Method {
        match self {
            Verb::Get => Method::GET,
            Verb::Post => Method::POST,
            Verb::Put => Method::PUT,
            Verb::Patch => Method::PATCH,
            Verb::Delete => Method::DELETE,
        }
    }

    pub fn from_method(method: &Method) -> Option<Self> {
        match *method {
            Method::GET => Some(Verb::Get),
            Method::POST => Some(Verb::Post),
            Method::PUT => Some(Verb::Put),
            Method::PATCH => Some(Verb::Patch),
            Method::DELETE => Some(Verb::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_method().as_str())
    }
}

/// Delivery semantics marker carried with every call.
///
/// The transport forwards it untouched; a router on the receiving side decides
/// what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChannelKind {
    /// Request and await a response.
    #[default]
    #[serde(rename = "DIRECT")]
    Direct,
    /// Fire-and-forget, delivered once.
    #[serde(rename = "NOTIFY")]
    Notify,
    /// Fire-and-forget, delivered to every subscriber.
    #[serde(rename = "NOTIFY+BROADCAST")]
    NotifyBroadcast,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Direct => "DIRECT",
            ChannelKind::Notify => "NOTIFY",
            ChannelKind::NotifyBroadcast => "NOTIFY+BROADCAST",
        }
    }

    /// Whether the caller expects a reply.
    pub fn expects_reply(&self) -> bool {
        matches!(self, ChannelKind::Direct)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DIRECT" => Ok(ChannelKind::Direct),
            "NOTIFY" => Ok(ChannelKind::Notify),
            "NOTIFY+BROADCAST" => Ok(ChannelKind::NotifyBroadcast),
            other => Err(TransportError::ProtocolViolation(format!(
                "unknown channel kind '{other}'"
            ))),
        }
    }
}

/// One remote procedure call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Target service name.
    pub service: String,
    pub verb: Verb,
    pub channel: ChannelKind,
    /// Caller identity forwarded to the server, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    /// Call arguments; serialised by the payload codec.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl RpcRequest {
    /// A `POST`/`DIRECT` call with no arguments.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            verb: Verb::default(),
            channel: ChannelKind::default(),
            access: None,
            args: serde_json::Value::Null,
        }
    }

    pub fn with_verb(mut self, verb: Verb) -> Self {
        self.verb = verb;
        self
    }

    pub fn with_channel(mut self, channel: ChannelKind) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_access(mut self, access: impl Into<String>) -> Self {
        self.access = Some(access.into());
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// Result of a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub value: serde_json::Value,
}

impl RpcResponse {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// An empty reply, used for notify-style calls.
    pub fn empty() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_defaults_port_by_scheme() {
        let ep = Endpoint::parse("https://svc.internal").unwrap();
        assert_eq!(ep, Endpoint::tls("svc.internal", 443));

        let ep: Endpoint = "http://127.0.0.1:7700".parse().unwrap();
        assert_eq!(ep, Endpoint::new("127.0.0.1", 7700));
        assert_eq!(ep.to_string(), "http://127.0.0.1:7700");
        assert_eq!(ep.authority(), "127.0.0.1:7700");
    }

    #[test]
    fn endpoint_parse_rejects_unknown_scheme() {
        let err = Endpoint::parse("ftp://host:21").unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn channel_kind_header_values() {
        for kind in [
            ChannelKind::Direct,
            ChannelKind::Notify,
            ChannelKind::NotifyBroadcast,
        ] {
            assert_eq!(kind.as_str().parse::<ChannelKind>().unwrap(), kind);
        }
        assert!("notify+broadcast".parse::<ChannelKind>().is_ok());
        assert!("SOMETIMES".parse::<ChannelKind>().is_err());
        assert!(!ChannelKind::Notify.expects_reply());
    }

    #[test]
    fn verb_maps_to_method() {
        assert_eq!(Verb::Put.as_method(), Method::PUT);
        assert_eq!(Verb::from_method(&Method::DELETE), Some(Verb::Delete));
        assert_eq!(Verb::from_method(&Method::OPTIONS), None);
    }
}
