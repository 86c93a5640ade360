//! Pattern-routed RPC mesh.
//!
//! Services register handlers for message patterns, advertise them in a
//! coordination store under short leases, discover each other's patterns
//! through store watches, and call each other with request/reply semantics
//! over push/pull sockets.
//!
//! # Architecture Overview
//!
//! ```text
//!   application
//!       │ register_handler / set_prefix / on_ready / send
//!       ▼
//!   ┌──────────────────────── service ────────────────────────┐
//!   │                                                         │
//!   │  routing ◀── directory (registry) ◀── store watch       │
//!   │     │            ▲                                      │
//!   │     │            └── directory (publisher) ──▶ store    │
//!   │     ▼                                                   │
//!   │  rpc (requests, dispatcher) ◀──▶ transport (pool, sockets)
//!   │                                                         │
//!   │  Cross-cutting: config, lifecycle, observability        │
//!   └─────────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod directory;
pub mod routing;
pub mod rpc;
pub mod service;

// Collaborators
pub mod store;
pub mod transport;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use config::MeshConfig;
pub use routing::{Pattern, PatternError, PatternIndex};
pub use rpc::{BoxError, RpcError};
pub use service::{MicroService, ServiceBuilder, ServiceError};
pub use store::{CoordinationStore, EtcdStore, MemoryStore, StoreEntry};
pub use transport::{MemoryTransport, TcpTransport, Transport};
