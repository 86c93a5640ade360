//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (at startup):
//!     raw pattern (text or JSON object)
//!     → pattern.rs (normalize, merge prefix, canonical string)
//!     → index.rs (insert into local handler index)
//!
//! Directory watch (at runtime):
//!     pattern appears / disappears
//!     → index.rs (global presence index)
//!
//! Message lookup:
//!     arbitrary JSON message
//!     → index.rs (candidate patterns via field/value postings)
//!     → most specific match, or none
//! ```
//!
//! # Design Decisions
//! - Patterns are immutable values compared by canonical string
//! - Deterministic: same index and message always yield the same match
//! - Absence is not an error here; callers decide

pub mod index;
pub mod pattern;

pub use index::PatternIndex;
pub use pattern::{Pattern, PatternError};
