//! Request/reply subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound (service send):
//!     RequestId::generate → requests.rs register(ttl)
//!     → envelope.rs encode [meta, message] → push socket
//!
//! Inbound (dispatcher.rs):
//!     frame → envelope.rs decode
//!     → Reply   → requests.rs resolve / reject
//!     → Request → local pattern index → handler → reply frame
//!                 → pool reply channel (connect to returnAddress)
//!
//! Sweep (requests.rs), every sweep_interval:
//!     expired entries → reject(Timeout)
//! ```

pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod requests;

pub use dispatcher::{handler_fn, Dispatcher, Handler};
pub use envelope::{DecodeError, Envelope, ReplyError, ReplyErrorKind, RequestId};
pub use error::{BoxError, RpcError};
pub use requests::{ReplyResult, RequestTable};
