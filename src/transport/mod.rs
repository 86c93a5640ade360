//! Transport subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound (one per service):
//!     bind(endpoint) → pull socket
//!     → frames delivered in received order on one channel
//!     → rpc dispatcher
//!
//! Outbound:
//!     pool.rs (reuse per address)
//!     → connect(address) → push socket
//!     → send(frame)
//! ```
//!
//! # Design Decisions
//! - Push/pull roles only: a push socket never receives, a pull socket never sends
//! - Replies travel over a push socket connected to the requester's inbound address
//! - Addresses are URLs (`tcp://host:port`, `mem://host:port`)
//! - Implementations are swappable behind object-safe traits

pub mod memory;
pub mod pool;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub use memory::MemoryTransport;
pub use pool::ConnectionPool;
pub use tcp::TcpTransport;

/// Errors raised by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address is not a valid transport URL.
    #[error("invalid transport address '{0}'")]
    InvalidAddress(String),

    /// Binding the inbound endpoint failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint is already owned by another pull socket.
    #[error("address already in use: {0}")]
    AddrInUse(String),

    /// Establishing an outbound connection failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a frame failed.
    #[error("failed to send to {address}: {source}")]
    Send {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Nobody is listening at the address.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The frame exceeds the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

/// A bound pull socket.
#[derive(Debug)]
pub struct Inbound {
    /// Actual endpoint (OS-assigned port resolved).
    pub endpoint: String,
    /// Raw frames in received order.
    pub frames: mpsc::Receiver<Vec<u8>>,
}

/// Send-only socket connected to one address.
#[async_trait]
pub trait PushSocket: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    fn address(&self) -> &str;
}

/// Point-to-point push/pull messaging.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// URL scheme of the addresses this transport understands.
    fn scheme(&self) -> &'static str;

    /// Endpoint to bind for a host/port pair.
    fn endpoint(&self, host: &str, port: u16) -> String {
        format!("{}://{}:{}", self.scheme(), host, port)
    }

    /// Bind a pull socket and report the actual endpoint.
    async fn bind(&self, endpoint: &str) -> Result<Inbound, TransportError>;

    /// Create a push socket towards `address`.
    async fn connect(&self, address: &str) -> Result<Arc<dyn PushSocket>, TransportError>;
}

/// Split a transport URL into host and port.
pub(crate) fn host_port(address: &str) -> Result<(String, u16), TransportError> {
    let url = Url::parse(address).map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// Address peers should use to reach a bound endpoint.
///
/// `external_ip` replaces the host when set; otherwise a wildcard bind host
/// is advertised as loopback.
pub fn advertised_address(endpoint: &str, external_ip: &str) -> Result<String, TransportError> {
    let mut url = Url::parse(endpoint).map_err(|_| TransportError::InvalidAddress(endpoint.to_string()))?;
    let replacement = if !external_ip.is_empty() {
        Some(external_ip)
    } else {
        match url.host_str() {
            Some("0.0.0.0") => Some("127.0.0.1"),
            Some("[::]") | Some("::") => Some("[::1]"),
            _ => None,
        }
    };
    if let Some(host) = replacement {
        url.set_host(Some(host))
            .map_err(|_| TransportError::InvalidAddress(format!("{} ({})", endpoint, host)))?;
    }
    Ok(url.to_string())
}
