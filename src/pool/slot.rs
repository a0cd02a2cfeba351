//! Per-endpoint pool state.
//!
//! # Responsibilities
//! - Hold the idle set and the pending (checked out or connecting) count
//! - Mutate both under one lock so acquire/release are linearizable
//! - Arm, cancel and fire idle-expiry timers
//!
//! Idle entries are addressed by a park token that is unique per parking, so
//! a timer armed for an earlier idle period can never close a connection that
//! has since been re-parked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::pool::lease::{Checkout, Lease, Ticket};
use crate::pool::{PoolConfig, PoolStats, Poolable};
use crate::rpc::Endpoint;

/// A live connection plus the bookkeeping the pool needs.
#[derive(Debug)]
pub(crate) struct PooledConnection<C> {
    pub(crate) inner: C,
    /// Completed request/response cycles.
    pub(crate) uses: u32,
    pub(crate) created_at: Instant,
    pub(crate) idle_since: Option<Instant>,
}

impl<C> PooledConnection<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self {
            inner,
            uses: 0,
            created_at: Instant::now(),
            idle_since: None,
        }
    }
}

struct IdleEntry<C> {
    token: u64,
    conn: PooledConnection<C>,
    expiry: Option<JoinHandle<()>>,
}

impl<C> IdleEntry<C> {
    /// Cancel the expiry timer and hand back the connection.
    fn into_connection(self) -> PooledConnection<C> {
        if let Some(timer) = self.expiry {
            timer.abort();
        }
        self.conn
    }
}

/// Idle set and pending counter, always mutated together.
pub(crate) struct SlotState<C> {
    /// Most recently parked last (LIFO reuse).
    idle: Vec<IdleEntry<C>>,
    pending: usize,
    next_token: u64,
}

impl<C: Poolable> SlotState<C> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            pending: 0,
            next_token: 1,
        }
    }

    /// Put a connection into the idle set.
    ///
    /// A connection already present (same id) is not added twice; it is
    /// handed back instead.
    fn park(&mut self, mut conn: PooledConnection<C>) -> Result<u64, PooledConnection<C>> {
        let id = conn.inner.id();
        if self.idle.iter().any(|e| e.conn.inner.id() == id) {
            return Err(conn);
        }
        let token = self.next_token;
        self.next_token += 1;
        conn.idle_since = Some(Instant::now());
        self.idle.push(IdleEntry {
            token,
            conn,
            expiry: None,
        });
        Ok(token)
    }

    fn set_expiry(&mut self, token: u64, timer: JoinHandle<()>) {
        match self.idle.iter_mut().find(|e| e.token == token) {
            Some(entry) => entry.expiry = Some(timer),
            None => timer.abort(),
        }
    }

    fn remove_token(&mut self, token: u64) -> Option<PooledConnection<C>> {
        let pos = self.idle.iter().position(|e| e.token == token)?;
        // The timer owning this token is the caller; dropping its handle detaches it.
        Some(self.idle.swap_remove(pos).conn)
    }

    fn remove_id(&mut self, id: ConnectionId) -> Option<PooledConnection<C>> {
        let pos = self.idle.iter().position(|e| e.conn.inner.id() == id)?;
        Some(self.idle.remove(pos).into_connection())
    }

    /// Pop the most recent idle connection that is still open.
    ///
    /// Closed ones encountered on the way are returned in `dead`.
    fn take_open(&mut self, dead: &mut Vec<PooledConnection<C>>) -> Option<PooledConnection<C>> {
        while let Some(entry) = self.idle.pop() {
            let conn = entry.into_connection();
            if conn.inner.is_open() {
                return Some(conn);
            }
            dead.push(conn);
        }
        None
    }

    fn occupancy(&self) -> usize {
        self.pending + self.idle.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    discarded: AtomicU64,
}

/// Pool for a single endpoint.
pub(crate) struct EndpointPool<C> {
    endpoint: Endpoint,
    label: String,
    config: PoolConfig,
    state: Mutex<SlotState<C>>,
    /// Signalled whenever occupancy drops or a connection is parked.
    ///
    /// Only `notify_waiters` is used: a stored permit would let a later
    /// acquire at the cap skip its wait.
    freed: Notify,
    counters: Counters,
}

impl<C: Poolable> EndpointPool<C> {
    pub(crate) fn new(endpoint: Endpoint, config: PoolConfig) -> Self {
        Self {
            label: endpoint.to_string(),
            endpoint,
            config,
            state: Mutex::new(SlotState::new()),
            freed: Notify::new(),
            counters: Counters::default(),
        }
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out an idle connection, or a ticket to open a new one.
    ///
    /// At the cap this waits up to `acquire_wait` for a connection to come
    /// back, then hands out a ticket anyway: the cap is soft.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Checkout<C> {
        let mut freed = {
            let mut dead = Vec::new();
            let mut state = self.lock();
            if let Some(conn) = state.take_open(&mut dead) {
                return self.check_out(&mut state, conn, dead);
            }
            self.discard_all(dead);
            if state.occupancy() < self.config.fine_connections {
                state.pending += 1;
                return Checkout::Open(Ticket::new(Arc::clone(self)));
            }

            // Register interest before the lock is dropped so no release is missed.
            let mut freed = Box::pin(self.freed.notified());
            freed.as_mut().enable();
            freed
        };

        tracing::debug!(
            endpoint = %self.label,
            cap = self.config.fine_connections,
            "Pool at capacity, waiting for a connection"
        );
        let deadline = tokio::time::Instant::now() + self.config.acquire_wait;
        while tokio::time::timeout_at(deadline, freed.as_mut()).await.is_ok() {
            // Every waiter is woken; only those that find room stop waiting.
            let mut dead = Vec::new();
            let mut state = self.lock();
            if let Some(conn) = state.take_open(&mut dead) {
                return self.check_out(&mut state, conn, dead);
            }
            self.discard_all(dead);
            if state.occupancy() < self.config.fine_connections {
                state.pending += 1;
                return Checkout::Open(Ticket::new(Arc::clone(self)));
            }
            freed = Box::pin(self.freed.notified());
            freed.as_mut().enable();
        }

        let mut dead = Vec::new();
        let mut state = self.lock();
        if let Some(conn) = state.take_open(&mut dead) {
            return self.check_out(&mut state, conn, dead);
        }
        self.discard_all(dead);
        state.pending += 1;
        if state.occupancy() > self.config.fine_connections {
            tracing::debug!(
                endpoint = %self.label,
                occupancy = state.occupancy(),
                cap = self.config.fine_connections,
                "Soft cap exceeded, opening connection anyway"
            );
        }
        Checkout::Open(Ticket::new(Arc::clone(self)))
    }

    fn check_out(
        self: &Arc<Self>,
        state: &mut SlotState<C>,
        conn: PooledConnection<C>,
        dead: Vec<PooledConnection<C>>,
    ) -> Checkout<C> {
        state.pending += 1;
        self.counters.reused.fetch_add(1, Ordering::Relaxed);
        self.discard_all(dead);
        metrics::record_pool_checkout(&self.label, true);
        tracing::trace!(
            endpoint = %self.label,
            connection_id = %conn.inner.id(),
            uses = conn.uses,
            "Reusing pooled connection"
        );
        Checkout::Reused(Lease::new(Arc::clone(self), conn))
    }

    fn discard_all(&self, dead: Vec<PooledConnection<C>>) {
        if !dead.is_empty() {
            self.counters
                .discarded
                .fetch_add(dead.len() as u64, Ordering::Relaxed);
        }
    }

    /// A ticket was turned into a live connection.
    pub(crate) fn opened(&self, conn: &C) {
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_checkout(&self.label, false);
        tracing::debug!(endpoint = %self.label, connection_id = %conn.id(), "Connection opened");
    }

    /// A ticket was dropped without a connection (connect failed).
    pub(crate) fn abandon(&self) {
        {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
        }
        self.freed.notify_waiters();
    }

    /// Return a checked-out connection after a completed cycle.
    pub(crate) fn release(self: &Arc<Self>, mut conn: PooledConnection<C>) {
        conn.uses = conn.uses.saturating_add(1);
        let retire = conn.uses >= self.config.keepalive_requests || !conn.inner.is_open();

        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);

        if retire {
            drop(state);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                endpoint = %self.label,
                connection_id = %conn.inner.id(),
                uses = conn.uses,
                age_ms = conn.created_at.elapsed().as_millis() as u64,
                "Retiring connection"
            );
            drop(conn);
            self.freed.notify_waiters();
            return;
        }

        match state.park(conn) {
            Ok(token) => {
                let timer = tokio::spawn(expire_after(
                    Arc::downgrade(self),
                    token,
                    self.config.idle_timeout,
                ));
                state.set_expiry(token, timer);
            }
            Err(duplicate) => {
                tracing::warn!(
                    endpoint = %self.label,
                    connection_id = %duplicate.inner.id(),
                    "Connection already idle, ignoring second release"
                );
            }
        }
        drop(state);
        self.freed.notify_waiters();
    }

    /// A checked-out connection is gone without completing its cycle.
    pub(crate) fn lost(&self, conn: PooledConnection<C>) {
        {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
        }
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            endpoint = %self.label,
            connection_id = %conn.inner.id(),
            "Discarding checked-out connection"
        );
        drop(conn);
        self.freed.notify_waiters();
    }

    /// The channel behind an idle connection became inactive.
    pub(crate) fn evict(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove_id(id);
        match removed {
            Some(conn) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(endpoint = %self.label, connection_id = %id, "Evicted inactive idle connection");
                drop(conn);
                self.freed.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Idle timer fired: remove the entry if it is still parked under `token`.
    fn expire(&self, token: u64) {
        let expired = self.lock().remove_token(token);
        if let Some(conn) = expired {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            metrics::record_pool_expired(&self.label);
            tracing::debug!(
                endpoint = %self.label,
                connection_id = %conn.inner.id(),
                idle_ms = conn.idle_since.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0),
                "Idle connection expired"
            );
            drop(conn);
            self.freed.notify_waiters();
        }
    }

    /// Close every idle connection.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.idle.drain(..).collect()
        };
        let count = drained.len();
        for entry in drained {
            drop(entry.into_connection());
        }
        if count > 0 {
            self.freed.notify_waiters();
        }
        count
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let (idle, pending) = {
            let state = self.lock();
            (state.idle.len(), state.pending)
        };
        PoolStats {
            idle,
            pending,
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

async fn expire_after<C: Poolable>(pool: Weak<EndpointPool<C>>, token: u64, after: Duration) {
    tokio::time::sleep(after).await;
    if let Some(pool) = pool.upgrade() {
        pool.expire(token);
    }
}
