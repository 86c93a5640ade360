//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use micro_mesh::{MeshConfig, MemoryStore, MemoryTransport, MicroService, ServiceBuilder};

/// Config with fast publish/watch cadences for in-process meshes.
pub fn fast_config(host_id: &str) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.host_id = host_id.to_string();
    config.directory.publish_interval_ms = 50;
    config.directory.lease_ttl_secs = 2;
    config.directory.ready_grace_ms = 20;
    config.directory.watch_retry_ms = 50;
    config.requests.timeout_ms = 1_000;
    config
}

/// In-process mesh fabric shared by every service of a test.
#[derive(Clone, Default)]
pub struct Mesh {
    pub transport: MemoryTransport,
    pub store: MemoryStore,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a service on this mesh after `setup` registered its handlers.
    pub async fn start<F>(&self, host_id: &str, setup: F) -> MicroService
    where
        F: FnOnce(&mut ServiceBuilder),
    {
        let mut builder = MicroService::builder(fast_config(host_id));
        setup(&mut builder);
        builder
            .start(Arc::new(self.transport.clone()), Arc::new(self.store.clone()))
            .await
            .unwrap()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future` with a generous upper bound so a hang fails the test.
pub async fn bounded<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation did not finish in time")
}
