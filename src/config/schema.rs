//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a mesh node.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for a mesh service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    /// Host identifier advertised in directory keys. Empty means random.
    pub host_id: String,

    /// Inbound endpoint configuration.
    pub listener: ListenerConfig,

    /// Directory publish/watch settings.
    pub directory: DirectoryConfig,

    /// Outbound request settings.
    pub requests: RequestConfig,

    /// Coordination store connection.
    pub store: StoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl MeshConfig {
    /// Apply `MICRO_EXT_IP` / `MICRO_EXT_PORT` overrides from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("MICRO_EXT_IP").ok(),
            std::env::var("MICRO_EXT_PORT").ok(),
        );
    }

    fn apply_overrides(&mut self, ext_ip: Option<String>, ext_port: Option<String>) {
        if let Some(ip) = ext_ip.filter(|s| !s.trim().is_empty()) {
            self.listener.external_ip = ip.trim().to_string();
        }
        if let Some(port) = ext_port.filter(|s| !s.trim().is_empty()) {
            match port.trim().parse::<u16>() {
                Ok(port) => self.listener.port = port,
                Err(e) => tracing::warn!(value = %port, error = %e, "Ignoring invalid MICRO_EXT_PORT"),
            }
        }
    }
}

/// Inbound endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host to bind the inbound socket on.
    pub host: String,

    /// Port to bind. 0 lets the OS pick an ephemeral port.
    pub port: u16,

    /// Host advertised to peers instead of the bound host (NAT/containers).
    pub external_ip: String,

    /// Maximum concurrent inbound connections (backpressure).
    pub max_connections: usize,

    /// Largest accepted frame in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            external_ip: String::new(),
            max_connections: 1024,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Directory publish and watch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Root key under which patterns are advertised.
    pub root: String,

    /// Interval between lease refreshes in milliseconds.
    pub publish_interval_ms: u64,

    /// Lease attached to every advertised entry in seconds.
    pub lease_ttl_secs: u64,

    /// Delay between the first successful publish and the ready callbacks.
    pub ready_grace_ms: u64,

    /// Delay before re-establishing a failed watch in milliseconds.
    pub watch_retry_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            root: "/micro".to_string(),
            publish_interval_ms: 5000,
            lease_ttl_secs: 60,
            ready_grace_ms: 500,
            watch_retry_ms: 1000,
        }
    }
}

/// Outbound request configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Default deadline for a reply in milliseconds.
    pub timeout_ms: u64,

    /// Cadence of the expiry sweep in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            sweep_interval_ms: 25,
        }
    }
}

/// Coordination store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the store (etcd v2 keys API).
    pub endpoint: String,

    /// Timeout for non-watch store calls in seconds.
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:2379".to_string(),
            request_timeout_secs: 5,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
