//! Service-facing call API.
//!
//! A `ServiceInvoker` is bound to one endpoint and one caller identity. It
//! builds the `RpcRequest` and hands it to the transport, either awaiting the
//! result, delivering it to a listener, or blocking the calling thread.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;

use crate::client::listener::{InvocationHandle, ResponseListener};
use crate::client::transport::{ClientTransport, RequestContext};
use crate::rpc::{ChannelKind, Endpoint, RpcRequest, RpcResponse, TransportError, TransportResult, Verb};

/// Calls services on one endpoint.
#[derive(Debug, Clone)]
pub struct ServiceInvoker {
    transport: ClientTransport,
    endpoint: Endpoint,
    access: Option<String>,
    channel: ChannelKind,
}

impl ServiceInvoker {
    pub fn new(transport: ClientTransport, endpoint: Endpoint) -> Self {
        Self {
            transport,
            endpoint,
            access: None,
            channel: ChannelKind::Direct,
        }
    }

    /// Caller identity sent with every request.
    pub fn with_access(mut self, access: impl Into<String>) -> Self {
        self.access = Some(access.into());
        self
    }

    pub fn with_channel(mut self, channel: ChannelKind) -> Self {
        self.channel = channel;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn context(&self, service: &str, verb: Verb, args: Value) -> RequestContext {
        let mut request = RpcRequest::new(service)
            .with_verb(verb)
            .with_channel(self.channel)
            .with_args(args);
        if let Some(access) = &self.access {
            request = request.with_access(access.clone());
        }
        RequestContext::new(self.endpoint.clone(), request)
    }

    /// `POST` to `service` and await the response.
    pub async fn call(&self, service: &str, args: Value) -> TransportResult<RpcResponse> {
        self.call_with(service, Verb::Post, args).await
    }

    pub async fn call_with(&self, service: &str, verb: Verb, args: Value) -> TransportResult<RpcResponse> {
        self.transport.execute(self.context(service, verb, args)).await
    }

    /// Start a call whose outcome goes to `listener`.
    pub fn invoke_with(
        &self,
        service: &str,
        verb: Verb,
        args: Value,
        listener: Arc<dyn ResponseListener>,
    ) -> InvocationHandle {
        self.transport.invoke(self.context(service, verb, args), listener)
    }

    /// Call and block the current thread until the outcome arrives.
    ///
    /// Must not be called from a runtime thread: the wait would stall the
    /// very executor that drives the call. Such calls fail with
    /// [`TransportError::WouldBlock`].
    pub fn invoke_blocking(&self, service: &str, verb: Verb, args: Value) -> TransportResult<RpcResponse> {
        if Handle::try_current().is_ok() {
            return Err(TransportError::WouldBlock);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let handle = self.invoke_with(service, verb, args, Arc::new(BlockingListener::new(tx)));

        match rx.recv_timeout(self.bridge_timeout()) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                handle.cancel();
                Err(TransportError::Timeout(self.bridge_timeout()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::ChannelLost("invocation ended without an outcome".into()))
            }
        }
    }

    /// Upper bound on one call: acquire wait, connect and read timeouts.
    fn bridge_timeout(&self) -> Duration {
        let config = self.transport.config();
        config.acquire_wait() + config.connect_timeout() + config.read_timeout()
    }
}

/// Forwards the outcome to a blocked caller.
struct BlockingListener {
    tx: Mutex<Option<SyncSender<TransportResult<RpcResponse>>>>,
}

impl BlockingListener {
    fn new(tx: SyncSender<TransportResult<RpcResponse>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn send(&self, outcome: TransportResult<RpcResponse>) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.try_send(outcome);
        }
    }
}

impl ResponseListener for BlockingListener {
    fn success(&self, response: RpcResponse) {
        self.send(Ok(response));
    }

    fn fail(&self, error: TransportError) {
        self.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::json;

    #[tokio::test]
    async fn blocking_call_on_runtime_thread_is_refused() {
        let transport = ClientTransport::new(ClientConfig::default(), Handle::current());
        let invoker = ServiceInvoker::new(transport, Endpoint::new("127.0.0.1", 1));
        let err = invoker
            .invoke_blocking("echo", Verb::Post, json!(null))
            .unwrap_err();
        assert!(matches!(err, TransportError::WouldBlock));
    }

    #[test]
    fn context_carries_identity_and_channel() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let transport = ClientTransport::new(ClientConfig::default(), runtime.handle().clone());
        let invoker = ServiceInvoker::new(transport, Endpoint::new("svc", 80))
            .with_access("caller-1")
            .with_channel(ChannelKind::NotifyBroadcast);

        let ctx = invoker.context("audit.log", Verb::Put, json!({"n": 1}));
        assert_eq!(ctx.endpoint, Endpoint::new("svc", 80));
        assert_eq!(ctx.request.service, "audit.log");
        assert_eq!(ctx.request.verb, Verb::Put);
        assert_eq!(ctx.request.channel, ChannelKind::NotifyBroadcast);
        assert_eq!(ctx.request.access.as_deref(), Some("caller-1"));
    }
}
