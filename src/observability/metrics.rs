//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define mesh metrics (requests, dispatch, directory, connections)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `mesh_requests_sent_total` (counter): outbound calls by outcome
//! - `mesh_request_duration_seconds` (histogram): send-to-settle latency
//! - `mesh_dispatch_total` (counter): inbound requests by outcome
//! - `mesh_frames_dropped_total` (counter): undecodable or unmatched frames
//! - `mesh_pending_requests` (gauge): in-flight outbound requests
//! - `mesh_directory_patterns` (gauge): live patterns known from peers
//! - `mesh_publish_total` (counter): directory publish cycles by outcome
//! - `mesh_connections` (gauge): pooled push sockets

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record a settled outbound request.
pub fn record_request(outcome: &'static str, start: Instant) {
    ::metrics::counter!("mesh_requests_sent_total", "outcome" => outcome).increment(1);
    ::metrics::histogram!("mesh_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// Record an outbound request refused before sending.
pub fn record_unroutable() {
    ::metrics::counter!("mesh_requests_sent_total", "outcome" => "unroutable").increment(1);
}

pub fn record_dispatch(outcome: &'static str) {
    ::metrics::counter!("mesh_dispatch_total", "outcome" => outcome).increment(1);
}

pub fn record_frame_dropped(reason: &'static str) {
    ::metrics::counter!("mesh_frames_dropped_total", "reason" => reason).increment(1);
}

pub fn record_pending(count: usize) {
    ::metrics::gauge!("mesh_pending_requests").set(count as f64);
}

pub fn record_directory_patterns(count: usize) {
    ::metrics::gauge!("mesh_directory_patterns").set(count as f64);
}

pub fn record_publish(success: bool) {
    let outcome = if success { "ok" } else { "error" };
    ::metrics::counter!("mesh_publish_total", "outcome" => outcome).increment(1);
}

pub fn record_connections(count: usize) {
    ::metrics::gauge!("mesh_connections").set(count as f64);
}
