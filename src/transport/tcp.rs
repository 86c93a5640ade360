//! TCP push/pull sockets.
//!
//! # Responsibilities
//! - Bind the inbound endpoint and accept peer connections
//! - Enforce max inbound connections via semaphore
//! - Frame messages with a big-endian u32 length prefix
//! - Funnel frames from every inbound connection into one channel
//!
//! # Design Decisions
//! - Accept loop stops once the frame receiver is dropped
//! - Oversized or truncated frames close the offending connection only
//! - Push sockets serialize writers behind an async mutex
//! - A push socket whose write was interrupted mid-frame refuses further
//!   frames, so the pool replaces it instead of mis-framing the stream

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;
use crate::transport::{host_port, Inbound, PushSocket, Transport, TransportError};

/// Only uniqueness matters for connection ids, not ordering.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Frames buffered between the socket readers and the dispatcher.
const INBOUND_QUEUE: usize = 1024;

/// TCP implementation of the push/pull transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    max_connections: usize,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new(config: &ListenerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(&ListenerConfig::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn bind(&self, endpoint: &str) -> Result<Inbound, TransportError> {
        let (host, port) = host_port(endpoint)?;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|source| TransportError::Bind {
                address: endpoint.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            address: endpoint.to_string(),
            source,
        })?;

        tracing::info!(
            address = %local_addr,
            max_connections = self.max_connections,
            "Inbound socket bound"
        );

        let (tx, frames) = mpsc::channel(INBOUND_QUEUE);
        let limit = Arc::new(Semaphore::new(self.max_connections));
        tokio::spawn(accept_loop(listener, limit, self.max_frame_bytes, tx));

        Ok(Inbound {
            endpoint: format!("tcp://{}", local_addr),
            frames,
        })
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PushSocket>, TransportError> {
        let (host, port) = host_port(address)?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|source| TransportError::Connect {
                address: address.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(address, error = %e, "Failed to set TCP_NODELAY");
        }
        tracing::debug!(address, "Push socket connected");

        Ok(Arc::new(TcpPush::new(address, stream, self.max_frame_bytes)))
    }
}

async fn accept_loop(
    listener: TcpListener,
    limit: Arc<Semaphore>,
    max_frame_bytes: usize,
    tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            _ = tx.closed() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = tx.closed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(
                    peer_addr = %peer,
                    available_permits = limit.available_permits(),
                    "Connection accepted"
                );
                tokio::spawn(read_frames(stream, peer, max_frame_bytes, tx.clone(), permit));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
        }
    }
    tracing::debug!("Inbound accept loop stopped");
}

async fn read_frames(
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_bytes: usize,
    tx: mpsc::Sender<Vec<u8>>,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut reader = BufReader::new(stream);

    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!(connection_id, peer_addr = %peer, error = %e, "Inbound read failed");
                break;
            }
        };
        if len > max_frame_bytes {
            tracing::warn!(
                connection_id,
                peer_addr = %peer,
                size = len,
                limit = max_frame_bytes,
                "Oversized frame, closing connection"
            );
            break;
        }

        let mut frame = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut frame).await {
            tracing::warn!(connection_id, peer_addr = %peer, error = %e, "Truncated frame");
            break;
        }
        if tx.send(frame).await.is_err() {
            break;
        }
    }
    tracing::trace!(connection_id, peer_addr = %peer, "Connection closed");
}

#[derive(Debug)]
struct PushStream {
    stream: TcpStream,
    /// Set while a frame is partially written.
    torn: bool,
}

/// Push socket over a single TCP stream.
struct TcpPush {
    address: String,
    stream: Mutex<PushStream>,
    max_frame_bytes: usize,
}

impl TcpPush {
    fn new(address: &str, stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            address: address.to_string(),
            stream: Mutex::new(PushStream { stream, torn: false }),
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl PushSocket for TcpPush {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: self.max_frame_bytes,
            });
        }
        let send_error = |source| TransportError::Send {
            address: self.address.clone(),
            source,
        };

        let mut guard = self.stream.lock().await;
        if guard.torn {
            return Err(send_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "an earlier frame was interrupted mid-write",
            )));
        }

        // Cleared only once the whole frame is out.
        guard.torn = true;
        let stream = &mut guard.stream;
        stream.write_u32(frame.len() as u32).await.map_err(send_error)?;
        stream.write_all(&frame).await.map_err(send_error)?;
        stream.flush().await.map_err(send_error)?;
        guard.torn = false;
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv(inbound: &mut Inbound) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), inbound.frames.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frames_round_trip_over_loopback() {
        let transport = TcpTransport::default();
        let mut inbound = transport.bind("tcp://127.0.0.1:0").await.unwrap();
        assert!(inbound.endpoint.starts_with("tcp://127.0.0.1:"));
        assert!(!inbound.endpoint.ends_with(":0"));

        let push = transport.connect(&inbound.endpoint).await.unwrap();
        push.send(b"first".to_vec()).await.unwrap();
        push.send(Vec::new()).await.unwrap();
        push.send(b"third".to_vec()).await.unwrap();

        assert_eq!(recv(&mut inbound).await, b"first");
        assert_eq!(recv(&mut inbound).await, b"");
        assert_eq!(recv(&mut inbound).await, b"third");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_locally() {
        let config = ListenerConfig {
            max_frame_bytes: 4,
            ..ListenerConfig::default()
        };
        let transport = TcpTransport::new(&config);
        let inbound = transport.bind("tcp://127.0.0.1:0").await.unwrap();
        let push = transport.connect(&inbound.endpoint).await.unwrap();
        assert!(matches!(
            push.send(vec![0; 5]).await,
            Err(TransportError::FrameTooLarge { size: 5, limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        let inbound = transport.bind("tcp://127.0.0.1:0").await.unwrap();
        let endpoint = inbound.endpoint.clone();
        drop(inbound);
        // Give the accept loop a moment to notice the receiver is gone.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            transport.connect(&endpoint).await,
            Err(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_interrupted_send_poisons_socket() {
        // A peer that accepts but never reads, so a large write stalls.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let push = TcpPush::new(&format!("tcp://{}", addr), stream, usize::MAX);
        let stalled = tokio::time::timeout(Duration::from_millis(100), push.send(vec![7u8; 64 * 1024 * 1024])).await;
        assert!(stalled.is_err(), "write should not fit in socket buffers");

        let err = push.send(b"next".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::Send { .. }));
    }
}
