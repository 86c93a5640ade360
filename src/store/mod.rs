//! Coordination store subsystem.
//!
//! # Data Flow
//! ```text
//! DirectoryPublisher
//!     → set(key, address, ttl)       (lease refreshed every publish cycle)
//!
//! ServiceDirectory task
//!     → watch(root)                  (stream of set/delete/expire events)
//!     → list(root)                   (bootstrap of entries written before the watch)
//! ```
//!
//! # Design Decisions
//! - The store is an external collaborator behind a narrow trait
//! - Every failure is a `StoreError`; callers log and retry, never abort
//! - Watch streams end by closing the channel; the consumer re-establishes

pub mod etcd;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Errors raised by coordination store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an unexpected status or body.
    #[error("unexpected store response: {0}")]
    Protocol(String),

    /// A key or endpoint could not be expressed.
    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Set,
    Delete,
    Expire,
}

/// One change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    /// Present on `Set`.
    pub value: Option<String>,
    /// Remaining lease, when the store reports one.
    pub ttl: Option<Duration>,
}

impl WatchEvent {
    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            action: WatchAction::Set,
            key: key.into(),
            value: Some(value.into()),
            ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            action: WatchAction::Delete,
            key: key.into(),
            value: None,
            ttl: None,
        }
    }

    pub fn expire(key: impl Into<String>) -> Self {
        Self {
            action: WatchAction::Expire,
            key: key.into(),
            value: None,
            ttl: None,
        }
    }
}

/// One live key returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub value: String,
    /// Remaining lease, when the store reports one.
    pub ttl: Option<Duration>,
}

impl StoreEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

/// Receiving side of a watch.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Hierarchical key/value store with leases and recursive watches.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Upsert `key` with auto-expiry after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Current entries under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<StoreEntry>, StoreError>;

    /// Stream of changes under `prefix`, recursively.
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}

/// True when `key` lies under `prefix` (segment-aligned).
pub(crate) fn under_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
