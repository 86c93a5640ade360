//! Outbound connection pool.
//!
//! # Responsibilities
//! - Create push sockets lazily, one per destination address
//! - Keep reply channels separately, keyed by requester return address
//! - Drop a socket after a failed send so the next use reconnects
//!
//! # Design Decisions
//! - Connections are never closed proactively; they live as long as the pool
//! - Reply channels connect outward to the requester's inbound endpoint;
//!   they never bind that address locally
//! - Concurrent first use may connect twice; the first socket stored wins

use std::sync::Arc;

use dashmap::DashMap;

use crate::observability::metrics;
use crate::transport::{PushSocket, Transport, TransportError};

/// Push sockets keyed by address.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    outbound: DashMap<String, Arc<dyn PushSocket>>,
    replies: DashMap<String, Arc<dyn PushSocket>>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            outbound: DashMap::new(),
            replies: DashMap::new(),
        }
    }

    /// Socket for requests towards a serving peer.
    pub async fn outbound(&self, address: &str) -> Result<Arc<dyn PushSocket>, TransportError> {
        self.get_or_connect(&self.outbound, address).await
    }

    /// Socket for replies towards a requester's inbound endpoint.
    pub async fn reply_channel(&self, return_address: &str) -> Result<Arc<dyn PushSocket>, TransportError> {
        self.get_or_connect(&self.replies, return_address).await
    }

    async fn get_or_connect(
        &self,
        map: &DashMap<String, Arc<dyn PushSocket>>,
        address: &str,
    ) -> Result<Arc<dyn PushSocket>, TransportError> {
        let existing = map.get(address).map(|entry| entry.value().clone());
        if let Some(socket) = existing {
            return Ok(socket);
        }

        let socket = self.transport.connect(address).await?;
        let socket = map
            .entry(address.to_string())
            .or_insert(socket)
            .value()
            .clone();
        metrics::record_connections(self.len());
        Ok(socket)
    }

    /// Forget a socket after a send failure.
    pub fn evict(&self, address: &str) {
        let removed = self.outbound.remove(address).is_some() | self.replies.remove(address).is_some();
        if removed {
            tracing::debug!(address, "Evicted push socket");
            metrics::record_connections(self.len());
        }
    }

    /// Total pooled sockets.
    pub fn len(&self) -> usize {
        self.outbound.len() + self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("outbound", &self.outbound.len())
            .field("replies", &self.replies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_reuses_sockets_per_address() {
        let transport = MemoryTransport::new();
        let inbound = transport.bind("mem://peer:1").await.unwrap();
        let pool = ConnectionPool::new(Arc::new(transport));

        let a = pool.outbound(&inbound.endpoint).await.unwrap();
        let b = pool.outbound(&inbound.endpoint).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        let reply = pool.reply_channel(&inbound.endpoint).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &reply));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_evict_forces_reconnect() {
        let pool = ConnectionPool::new(Arc::new(MemoryTransport::new()));
        let first = pool.outbound("mem://peer:9").await.unwrap();
        pool.evict("mem://peer:9");
        assert!(pool.is_empty());
        let second = pool.outbound("mem://peer:9").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_invalid_address_is_not_pooled() {
        let pool = ConnectionPool::new(Arc::new(MemoryTransport::new()));
        assert!(pool.outbound("garbage").await.is_err());
        assert!(pool.is_empty());
    }
}
