//! Application handlers and their lookup.
//!
//! Services are registered by name. Lookup tries the exact name first, then
//! successively shorter dotted prefixes, so a handler registered as
//! `billing` also serves `billing.charge`.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::StatusCode;
use thiserror::Error;

use crate::duplex::Outbox;
use crate::rpc::{RpcHead, RpcRequest, RpcResponse};

/// Failure reported by a handler. Mapped onto a response status.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandlerError::Forbidden(_) => StatusCode::FORBIDDEN,
            HandlerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HandlerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// What a handler knows about the call besides its arguments.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub head: RpcHead,
    pub peer: Option<SocketAddr>,
    /// Present when the call arrived over a duplex channel; lets the handler
    /// push messages to the peer.
    pub push: Option<Outbox>,
}

#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &CallContext, request: RpcRequest) -> Result<RpcResponse, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(CallContext, RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcResponse, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &CallContext, request: RpcRequest) -> Result<RpcResponse, HandlerError> {
        (self.0)(ctx.clone(), request).await
    }
}

/// Wrap a closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(CallContext, RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcResponse, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Service name → handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `service`, replacing any previous one.
    pub fn register(mut self, service: impl Into<String>, handler: Arc<dyn RpcHandler>) -> Self {
        let service = service.into();
        tracing::debug!(service = %service, "Registered handler");
        self.handlers.insert(service, handler);
        self
    }

    pub fn resolve(&self, service: &str) -> Option<Arc<dyn RpcHandler>> {
        let mut name = service;
        loop {
            if let Some(handler) = self.handlers.get(name) {
                return Some(Arc::clone(handler));
            }
            match name.rfind('.') {
                Some(dot) => name = &name[..dot],
                None => return None,
            }
        }
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.services().collect();
        services.sort_unstable();
        f.debug_struct("HandlerRegistry").field("services", &services).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::JsonCodec;
    use crate::rpc::PayloadCodec;
    use serde_json::json;

    fn echo() -> Arc<dyn RpcHandler> {
        handler_fn(|_ctx, request: RpcRequest| async move { Ok(RpcResponse::new(request.args)) })
    }

    #[test]
    fn resolves_exact_then_dotted_prefix() {
        let registry = HandlerRegistry::new()
            .register("billing", echo())
            .register("billing.refund", echo());

        assert!(registry.resolve("billing").is_some());
        assert!(registry.resolve("billing.charge").is_some());
        assert!(registry.resolve("billing.refund.partial").is_some());
        assert!(registry.resolve("inventory").is_none());
        assert!(registry.resolve("").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn closure_handler_sees_request() {
        let request = RpcRequest::new("echo").with_args(json!({"a": 1}));
        let ctx = CallContext {
            head: RpcHead::for_request(&request, JsonCodec.content_type()),
            peer: None,
            push: None,
        };
        let response = echo().handle(&ctx, request).await.unwrap();
        assert_eq!(response.value, json!({"a": 1}));
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(HandlerError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(HandlerError::Internal("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
