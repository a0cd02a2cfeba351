//! Self-healing duplex session.
//!
//! # Reconnect loop
//! ```text
//! connect ──ok──▶ connected (channel stored) ──lost──┐
//!    │                                               │
//!    └──err──▶ reconnect pending ◀────────────────────┘
//!                    │ sleep(retry interval)
//!                    └──▶ connect
//! ```
//!
//! A single supervisor task owns the loop, so a session never has more than
//! one reconnect attempt scheduled. Calls made while disconnected fail at
//! once with [`TransportError::ChannelLost`]; nothing is queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::KeepaliveConfig;
use crate::duplex::channel::{DuplexChannel, Outbox};
use crate::duplex::connector::{DuplexConnector, WsConnector};
use crate::duplex::envelope::{Envelope, EnvelopeBody};
use crate::observability::metrics;
use crate::resilience::{with_timeout, RetryPolicy};
use crate::rpc::{ChannelKind, RpcRequest, RpcResponse, TransportError, TransportResult};

const PUSH_BUFFER: usize = 64;

type Reply = oneshot::Sender<TransportResult<RpcResponse>>;

/// A duplex channel that reconnects on its own.
pub struct KeepaliveSession {
    inner: Arc<SessionInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct SessionInner {
    url: Url,
    config: KeepaliveConfig,
    policy: RetryPolicy,
    connector: Arc<dyn DuplexConnector>,
    channel: ArcSwapOption<Outbox>,
    pending: Mutex<HashMap<u64, Reply>>,
    next_id: AtomicU64,
    attempts: AtomicU64,
    reconnect_pending: AtomicBool,
    pushes: broadcast::Sender<Envelope>,
    connected: watch::Sender<bool>,
}

impl KeepaliveSession {
    /// Start a session; the first handshake begins immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(url: Url, config: KeepaliveConfig, connector: Arc<dyn DuplexConnector>) -> Self {
        let policy = RetryPolicy::fixed(config.retry_interval());
        Self::with_policy(url, config, connector, policy)
    }

    /// Start a WebSocket session to `url`.
    pub fn connect_ws(url: &str, config: KeepaliveConfig) -> TransportResult<Self> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;
        let connector = Arc::new(WsConnector::new(config.connect_timeout()));
        Ok(Self::connect(url, config, connector))
    }

    /// Start a session with an explicit retry policy.
    pub fn with_policy(
        url: Url,
        config: KeepaliveConfig,
        connector: Arc<dyn DuplexConnector>,
        policy: RetryPolicy,
    ) -> Self {
        let (pushes, _) = broadcast::channel(PUSH_BUFFER);
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            url,
            config,
            policy,
            connector,
            channel: ArcSwapOption::empty(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            attempts: AtomicU64::new(0),
            reconnect_pending: AtomicBool::new(false),
            pushes,
            connected,
        });
        let supervisor = tokio::spawn(supervise(Arc::clone(&inner)));
        Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Send a request and wait for its reply.
    ///
    /// The call is sent as `DIRECT` whatever channel kind it carries.
    pub async fn request(&self, request: RpcRequest) -> TransportResult<RpcResponse> {
        let request = request.with_channel(ChannelKind::Direct);
        let outbox = self.inner.outbox()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id, tx);

        // The channel may have been lost between the load and the insert.
        if self.inner.channel.load().is_none() {
            self.inner.pending().remove(&id);
            return Err(not_connected());
        }
        if let Err(e) = outbox.send(Envelope::request(id, &request)).await {
            self.inner.pending().remove(&id);
            return Err(e);
        }

        let limit = self.inner.config.request_timeout();
        let reply = async {
            rx.await
                .unwrap_or_else(|_| Err(TransportError::ChannelLost("session closed".into())))
        };
        let outcome = with_timeout(limit, reply).await;
        if matches!(outcome, Err(TransportError::Timeout(_))) {
            self.inner.pending().remove(&id);
            tracing::debug!(id, service = %request.service, "Duplex request timed out");
        }
        outcome
    }

    /// Send a one-way message. `DIRECT` is downgraded to `NOTIFY`.
    pub async fn notify(&self, request: RpcRequest) -> TransportResult<()> {
        let request = if request.channel.expects_reply() {
            request.with_channel(ChannelKind::Notify)
        } else {
            request
        };
        let outbox = self.inner.outbox()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        outbox.send(Envelope::request(id, &request)).await
    }

    /// Server-initiated messages, across reconnects.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.pushes.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.load().is_some()
    }

    /// Connect attempts made so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Whether a reconnect is scheduled and waiting for its interval.
    pub fn reconnect_pending(&self) -> bool {
        self.inner.reconnect_pending.load(Ordering::SeqCst)
    }

    /// Wait up to `limit` for the session to be connected.
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.inner.connected.subscribe();
        let connected = tokio::time::timeout(limit, rx.wait_for(|connected| *connected)).await;
        matches!(connected, Ok(Ok(_)))
    }

    /// Stop reconnecting and drop the current channel.
    pub fn close(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            self.inner.disconnect("session closed");
            self.inner.reconnect_pending.store(false, Ordering::SeqCst);
            tracing::debug!(url = %self.inner.url, "Keepalive session closed");
        }
    }
}

impl Drop for KeepaliveSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for KeepaliveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveSession")
            .field("url", &self.inner.url.as_str())
            .field("connected", &self.is_connected())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl SessionInner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Reply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> TransportResult<Arc<Outbox>> {
        self.channel.load_full().ok_or_else(not_connected)
    }

    async fn run_channel(&self, channel: DuplexChannel) {
        let DuplexChannel { outbox, mut inbound } = channel;
        self.channel.store(Some(Arc::new(outbox)));
        self.connected.send_replace(true);

        while let Some(envelope) = inbound.recv().await {
            self.route(envelope);
        }
        self.disconnect("duplex channel lost");
    }

    fn route(&self, envelope: Envelope) {
        if matches!(envelope.body, EnvelopeBody::Request { .. }) {
            // Nobody listening is fine.
            let _ = self.pushes.send(envelope);
            return;
        }
        let id = envelope.id;
        let waiter = self.pending().remove(&id);
        match (waiter, envelope.into_outcome()) {
            (Some(waiter), Some(outcome)) => {
                let _ = waiter.send(outcome);
            }
            _ => tracing::debug!(id, url = %self.url, "Dropping reply with no waiting request"),
        }
    }

    /// Forget the channel and fail every call waiting on it.
    fn disconnect(&self, reason: &str) {
        self.channel.store(None);
        self.connected.send_replace(false);
        let waiting: Vec<Reply> = self.pending().drain().map(|(_, tx)| tx).collect();
        for tx in waiting {
            let _ = tx.send(Err(TransportError::ChannelLost(reason.to_string())));
        }
    }
}

fn not_connected() -> TransportError {
    TransportError::ChannelLost("duplex channel not connected".into())
}

async fn supervise(inner: Arc<SessionInner>) {
    let mut failures: u32 = 0;
    loop {
        inner.reconnect_pending.store(false, Ordering::SeqCst);
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let connect = inner.connector.connect(&inner.url);
        match with_timeout(inner.config.connect_timeout(), connect).await {
            Ok(channel) => {
                metrics::record_keepalive_attempt(inner.url.as_str(), true);
                tracing::info!(url = %inner.url, attempt, "Duplex channel connected");
                failures = 0;
                inner.run_channel(channel).await;
                tracing::warn!(url = %inner.url, "Duplex channel lost");
            }
            Err(e) => {
                metrics::record_keepalive_attempt(inner.url.as_str(), false);
                tracing::warn!(url = %inner.url, attempt, error = %e, "Duplex connect failed");
            }
        }

        failures = failures.saturating_add(1);
        let Some(delay) = inner.policy.next_delay(failures) else {
            tracing::error!(url = %inner.url, failures, "Giving up on duplex channel");
            return;
        };
        inner.reconnect_pending.store(true, Ordering::SeqCst);
        tracing::debug!(url = %inner.url, delay_secs = delay.as_secs(), "Reconnect scheduled");
        tokio::time::sleep(delay).await;
    }
}
