//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (service.rs):
//!     Validate config → Bind inbound → Spawn tasks
//!     (dispatcher, sweeper, publisher, directory watch)
//!
//! Shutdown (shutdown.rs):
//!     shutdown() / drop → broadcast → every task leaves its loop
//!     → pending requests settle with Closed
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls shutdown()
//! ```
//!
//! # Design Decisions
//! - One broadcast channel per service instance, never process-global
//! - Triggering twice is harmless

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
