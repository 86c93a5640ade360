//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields (request_id, address, pattern) on every event
//! - Metrics are recorded unconditionally; exposition is opt-in
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
