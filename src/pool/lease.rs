//! Checkout guards.
//!
//! A [`Lease`] owns a connection for one request/response cycle. Releasing it
//! consumes the lease, so the same checkout cannot be returned twice. Dropping
//! a lease without releasing it counts as a lost connection.
//!
//! A [`Ticket`] reserves a slot while a new connection is being opened.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::net::ConnectionId;
use crate::pool::slot::{EndpointPool, PooledConnection};
use crate::pool::Poolable;
use crate::rpc::Endpoint;

/// Result of [`ConnectionPool::acquire`](crate::pool::ConnectionPool::acquire).
#[derive(Debug)]
pub enum Checkout<C: Poolable> {
    /// An idle connection, its expiry timer already cancelled.
    Reused(Lease<C>),
    /// No idle connection; the caller opens one and fulfils the ticket.
    Open(Ticket<C>),
}

impl<C: Poolable> Checkout<C> {
    pub fn is_reused(&self) -> bool {
        matches!(self, Checkout::Reused(_))
    }
}

/// Reserved slot for a connection that is being opened.
///
/// Dropping an unfulfilled ticket gives the slot back.
pub struct Ticket<C: Poolable> {
    pool: Arc<EndpointPool<C>>,
    fulfilled: bool,
}

impl<C: Poolable> Ticket<C> {
    pub(crate) fn new(pool: Arc<EndpointPool<C>>) -> Self {
        Self {
            pool,
            fulfilled: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.pool.endpoint()
    }

    /// Attach the freshly opened connection.
    pub fn fulfil(mut self, conn: C) -> Lease<C> {
        self.fulfilled = true;
        self.pool.opened(&conn);
        Lease::new(Arc::clone(&self.pool), PooledConnection::new(conn))
    }
}

impl<C: Poolable> Drop for Ticket<C> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.pool.abandon();
        }
    }
}

impl<C: Poolable> std::fmt::Debug for Ticket<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("endpoint", self.pool.endpoint())
            .finish()
    }
}

/// A checked-out connection.
pub struct Lease<C: Poolable> {
    pool: Arc<EndpointPool<C>>,
    conn: Option<PooledConnection<C>>,
}

impl<C: Poolable> Lease<C> {
    pub(crate) fn new(pool: Arc<EndpointPool<C>>, conn: PooledConnection<C>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn pooled(&self) -> &PooledConnection<C> {
        self.conn
            .as_ref()
            .expect("lease holds its connection until consumed")
    }

    pub fn id(&self) -> ConnectionId {
        self.pooled().inner.id()
    }

    /// Completed cycles on this connection before the current one.
    pub fn uses(&self) -> u32 {
        self.pooled().uses
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.pool.endpoint()
    }

    /// The cycle completed; hand the connection back for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    /// The connection is unusable; close it and free the slot.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.lost(conn);
        }
    }
}

impl<C: Poolable> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.pooled().inner
    }
}

impl<C: Poolable> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self
            .conn
            .as_mut()
            .expect("lease holds its connection until consumed")
            .inner
    }
}

impl<C: Poolable> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.lost(conn);
        }
    }
}

impl<C: Poolable> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Lease");
        s.field("endpoint", self.pool.endpoint());
        if let Some(conn) = &self.conn {
            s.field("id", &conn.inner.id()).field("uses", &conn.uses);
        }
        s.finish()
    }
}
