//! Endpoint-keyed pool registry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::net::ConnectionId;
use crate::pool::lease::Checkout;
use crate::pool::slot::EndpointPool;
use crate::pool::{PoolConfig, PoolStats, Poolable};
use crate::rpc::Endpoint;

/// Connection pool shared by every caller of a client transport.
pub struct ConnectionPool<C: Poolable> {
    inner: Arc<PoolInner<C>>,
}

struct PoolInner<C> {
    config: PoolConfig,
    endpoints: DashMap<Endpoint, Arc<EndpointPool<C>>>,
}

impl<C: Poolable> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Poolable> ConnectionPool<C> {
    pub fn new(config: PoolConfig) -> Self {
        tracing::debug!(
            fine_connections = config.fine_connections,
            keepalive_requests = config.keepalive_requests,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            "Connection pool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                config,
                endpoints: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn slot(&self, endpoint: &Endpoint) -> Arc<EndpointPool<C>> {
        if let Some(existing) = self.inner.endpoints.get(endpoint) {
            return Arc::clone(existing.value());
        }
        let slot = self
            .inner
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(EndpointPool::new(endpoint.clone(), self.inner.config.clone()))
            });
        Arc::clone(slot.value())
    }

    /// Check out a connection for `endpoint`.
    ///
    /// Never fails: at worst the caller gets a ticket to open a connection
    /// beyond the soft cap after waiting `acquire_wait`.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Checkout<C> {
        self.slot(endpoint).acquire().await
    }

    /// The channel behind connection `id` went inactive.
    ///
    /// Removes it from the idle set if it is parked there. A checked-out
    /// connection is left to its lease.
    pub fn connection_lost(&self, endpoint: &Endpoint, id: ConnectionId) -> bool {
        match self.inner.endpoints.get(endpoint) {
            Some(slot) => slot.value().evict(id),
            None => false,
        }
    }

    pub fn stats(&self, endpoint: &Endpoint) -> PoolStats {
        self.inner
            .endpoints
            .get(endpoint)
            .map(|slot| slot.value().stats())
            .unwrap_or_default()
    }

    /// Idle connections across all endpoints.
    pub fn total_idle(&self) -> usize {
        self.inner
            .endpoints
            .iter()
            .map(|slot| slot.value().stats().idle)
            .sum()
    }

    /// Close every idle connection on every endpoint.
    pub fn clear(&self) -> usize {
        self.inner
            .endpoints
            .iter()
            .map(|slot| slot.value().clear())
            .sum()
    }
}

impl<C: Poolable> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("endpoints", &self.inner.endpoints.len())
            .finish()
    }
}
