//! In-process push/pull sockets.
//!
//! Services sharing one `MemoryTransport` (by clone) reach each other through
//! a registry of bound endpoints. Sends resolve the endpoint at send time, so
//! a push socket outlives its peer the way a connected TCP socket would.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::transport::{host_port, Inbound, PushSocket, Transport, TransportError};

const INBOUND_QUEUE: usize = 1024;

/// Shared in-memory endpoint registry.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    endpoints: Arc<DashMap<String, mpsc::Sender<Vec<u8>>>>,
    next_port: Arc<AtomicU16>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
            next_port: Arc::new(AtomicU16::new(1)),
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a bound endpoint, as if its owner vanished.
    pub fn unbind(&self, endpoint: &str) -> bool {
        self.endpoints.remove(endpoint).is_some()
    }

    /// Number of live bound endpoints.
    pub fn bound(&self) -> usize {
        self.endpoints.iter().filter(|e| !e.value().is_closed()).count()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn scheme(&self) -> &'static str {
        "mem"
    }

    async fn bind(&self, endpoint: &str) -> Result<Inbound, TransportError> {
        let (host, mut port) = host_port(endpoint)?;
        if port == 0 {
            port = self.next_port.fetch_add(1, Ordering::Relaxed);
        }
        let endpoint = self.endpoint(&host, port);

        let (tx, frames) = mpsc::channel(INBOUND_QUEUE);
        match self.endpoints.entry(endpoint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if !existing.get().is_closed() {
                    return Err(TransportError::AddrInUse(endpoint));
                }
                existing.insert(tx);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        tracing::debug!(address = %endpoint, "Memory endpoint bound");
        Ok(Inbound { endpoint, frames })
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PushSocket>, TransportError> {
        host_port(address)?;
        Ok(Arc::new(MemoryPush {
            address: address.to_string(),
            endpoints: self.endpoints.clone(),
        }))
    }
}

struct MemoryPush {
    address: String,
    endpoints: Arc<DashMap<String, mpsc::Sender<Vec<u8>>>>,
}

#[async_trait]
impl PushSocket for MemoryPush {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        // Clone the sender so no map guard is held across the await.
        let sender = self
            .endpoints
            .get(&self.address)
            .map(|s| s.value().clone())
            .ok_or_else(|| TransportError::Unreachable(self.address.clone()))?;
        sender
            .send(frame)
            .await
            .map_err(|_| TransportError::Unreachable(self.address.clone()))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_assigns_port_and_delivers() {
        let transport = MemoryTransport::new();
        let mut a = transport.bind("mem://node:0").await.unwrap();
        let b = transport.bind("mem://node:0").await.unwrap();
        assert_ne!(a.endpoint, b.endpoint);

        let push = transport.connect(&a.endpoint).await.unwrap();
        push.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(a.frames.recv().await.unwrap(), b"hello");
        assert_eq!(transport.bound(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_is_exclusive_until_released() {
        let transport = MemoryTransport::new();
        let inbound = transport.bind("mem://node:7").await.unwrap();
        assert!(matches!(
            transport.bind("mem://node:7").await,
            Err(TransportError::AddrInUse(_))
        ));
        drop(inbound);
        assert!(transport.bind("mem://node:7").await.is_ok());
    }

    #[tokio::test]
    async fn test_send_to_missing_peer() {
        let transport = MemoryTransport::new();
        let push = transport.connect("mem://nobody:1").await.unwrap();
        assert!(matches!(
            push.send(vec![1]).await,
            Err(TransportError::Unreachable(_))
        ));

        let inbound = transport.bind("mem://gone:2").await.unwrap();
        let push = transport.connect(&inbound.endpoint).await.unwrap();
        assert!(transport.unbind(&inbound.endpoint));
        assert!(push.send(vec![1]).await.is_err());
    }
}
