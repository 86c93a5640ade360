//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, lease outlives refresh)
//! - Validate directory key shape (root, host id)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MeshConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::MeshConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &MeshConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.host_id.contains('/') {
        errors.push(ValidationError::new("host_id", "must not contain '/'"));
    }

    if config.listener.host.trim().is_empty() {
        errors.push(ValidationError::new("listener.host", "must not be empty"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.listener.max_frame_bytes == 0 {
        errors.push(ValidationError::new("listener.max_frame_bytes", "must be greater than 0"));
    }

    let directory = &config.directory;
    if !directory.root.starts_with('/') || (directory.root.len() > 1 && directory.root.ends_with('/')) {
        errors.push(ValidationError::new(
            "directory.root",
            "must start with '/' and not end with '/'",
        ));
    }
    if directory.publish_interval_ms == 0 {
        errors.push(ValidationError::new("directory.publish_interval_ms", "must be greater than 0"));
    }
    if directory.lease_ttl_secs == 0 {
        errors.push(ValidationError::new("directory.lease_ttl_secs", "must be greater than 0"));
    } else if directory.lease_ttl_secs.saturating_mul(1000) <= directory.publish_interval_ms {
        errors.push(ValidationError::new(
            "directory.lease_ttl_secs",
            "lease must be longer than the publish interval",
        ));
    }
    if directory.watch_retry_ms == 0 {
        errors.push(ValidationError::new("directory.watch_retry_ms", "must be greater than 0"));
    }

    if config.requests.timeout_ms == 0 {
        errors.push(ValidationError::new("requests.timeout_ms", "must be greater than 0"));
    }
    if config.requests.sweep_interval_ms == 0 {
        errors.push(ValidationError::new("requests.sweep_interval_ms", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
