//! RPC error taxonomy.

use thiserror::Error;

use crate::rpc::envelope::{ReplyError, ReplyErrorKind};
use crate::transport::TransportError;

/// Error type handlers may return; any `std::error::Error` converts with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors settling an outbound request.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No live pattern (or no live host) serves the message.
    #[error("no live pattern matches message {message}")]
    Unroutable { message: String },

    /// No reply arrived before the deadline.
    #[error("request {request_id} timed out after {after_ms}ms")]
    Timeout { request_id: String, after_ms: u64 },

    /// The peer had no handler matching the message.
    #[error("no handler: {0}")]
    NoHandler(String),

    /// The peer's handler failed.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The request could not be delivered.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The message could not be encoded.
    #[error("failed to encode message: {0}")]
    Codec(String),

    /// The service shut down while the request was pending.
    #[error("service closed before a reply arrived")]
    Closed,
}

impl RpcError {
    /// Metric label for this outcome.
    pub fn outcome(&self) -> &'static str {
        match self {
            RpcError::Unroutable { .. } => "unroutable",
            RpcError::Timeout { .. } => "timeout",
            RpcError::NoHandler(_) | RpcError::Handler(_) => "remote_error",
            RpcError::Transport(_) | RpcError::Codec(_) => "transport",
            RpcError::Closed => "closed",
        }
    }
}

impl From<ReplyError> for RpcError {
    fn from(error: ReplyError) -> Self {
        match error.kind {
            ReplyErrorKind::NoHandler => RpcError::NoHandler(error.message),
            ReplyErrorKind::Handler => RpcError::Handler(error.message),
        }
    }
}
