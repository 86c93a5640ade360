//! Envelope wire format.
//!
//! Every frame is one JSON array `[meta, message]`:
//!
//! ```text
//! meta.requestId      string, unique per originating process
//! meta.returnAddress  string, sender's inbound address
//! meta.mode           absent on requests, "reply" on replies
//! meta.error          only on failed replies: {"kind": ..., "message": ...}
//! ```
//!
//! Decoding is exhaustive: unknown fields, unknown modes and errors attached
//! to requests are rejected instead of being guessed at.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

const REPLY_MODE: &str = "reply";

/// Correlates a reply with its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh id from a v4 UUID (122 random bits).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category of a failed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyErrorKind {
    NoHandler,
    Handler,
}

/// Error carried in a reply's meta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyError {
    pub kind: ReplyErrorKind,
    pub message: String,
}

impl ReplyError {
    pub fn no_handler(message: impl Into<String>) -> Self {
        Self {
            kind: ReplyErrorKind::NoHandler,
            message: message.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self {
            kind: ReplyErrorKind::Handler,
            message: message.into(),
        }
    }
}

/// Frame metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Request {
        request_id: RequestId,
        return_address: String,
    },
    Reply {
        request_id: RequestId,
        return_address: String,
        error: Option<ReplyError>,
    },
}

/// Errors decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("undecodable frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown envelope mode '{0}'")]
    UnknownMode(String),

    #[error("request envelope carries an error")]
    ErrorOnRequest,

    #[error("empty request id")]
    EmptyRequestId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WireMeta {
    request_id: String,
    return_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ReplyError>,
}

impl Envelope {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::Request { request_id, .. } | Envelope::Reply { request_id, .. } => request_id,
        }
    }

    pub fn return_address(&self) -> &str {
        match self {
            Envelope::Request { return_address, .. } | Envelope::Reply { return_address, .. } => {
                return_address
            }
        }
    }

    /// Encode `[meta, message]`.
    pub fn encode(&self, message: &Value) -> Result<Vec<u8>, serde_json::Error> {
        let meta = match self {
            Envelope::Request {
                request_id,
                return_address,
            } => WireMeta {
                request_id: request_id.0.clone(),
                return_address: return_address.clone(),
                mode: None,
                error: None,
            },
            Envelope::Reply {
                request_id,
                return_address,
                error,
            } => WireMeta {
                request_id: request_id.0.clone(),
                return_address: return_address.clone(),
                mode: Some(REPLY_MODE.to_string()),
                error: error.clone(),
            },
        };
        serde_json::to_vec(&(meta, message))
    }

    /// Decode a frame into its envelope and message.
    pub fn decode(frame: &[u8]) -> Result<(Envelope, Value), DecodeError> {
        let (meta, message): (WireMeta, Value) = serde_json::from_slice(frame)?;
        if meta.request_id.is_empty() {
            return Err(DecodeError::EmptyRequestId);
        }
        let request_id = RequestId(meta.request_id);

        let envelope = match meta.mode.as_deref() {
            None => {
                if meta.error.is_some() {
                    return Err(DecodeError::ErrorOnRequest);
                }
                Envelope::Request {
                    request_id,
                    return_address: meta.return_address,
                }
            }
            Some(REPLY_MODE) => Envelope::Reply {
                request_id,
                return_address: meta.return_address,
                error: meta.error,
            },
            Some(other) => return Err(DecodeError::UnknownMode(other.to_string())),
        };
        Ok((envelope, message))
    }
}
