//! Service directory subsystem.
//!
//! # Data Flow
//! ```text
//! Publish (publisher.rs), every publish_interval:
//!     local patterns → key.rs → store.set(key, address, lease)
//!     first full cycle → sleep(ready_grace) → ready callbacks
//!
//! Discover (watcher.rs):
//!     store.watch(root) + store.list(root)
//!     → registry.rs apply(set | delete | expire)
//!     → global pattern index (pattern present ⇔ ≥1 live host)
//!
//! Route (service send):
//!     message → registry.route() → (pattern, first live address)
//! ```
//!
//! # Design Decisions
//! - Liveness comes from store leases; the registry also prunes lapsed
//!   leases itself in case an expire event is lost
//! - The registry is plain data; tasks own the I/O

pub mod key;
pub mod publisher;
pub mod registry;
pub mod watcher;

pub use key::{directory_key, parse_key};
pub use publisher::{DirectoryPublisher, ReadyCallback};
pub use registry::ServiceDirectory;
pub use watcher::DirectoryWatcher;
