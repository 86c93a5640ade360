//! Periodic advertisement of local patterns.
//!
//! # Responsibilities
//! - Upsert `(pattern, self host) → self address` for every local pattern
//! - Refresh the lease on a fixed cadence well inside its TTL
//! - Fire the ready callbacks once, a grace delay after the first full cycle
//!
//! # Design Decisions
//! - A cycle is successful only when every pattern was written
//! - Failures are logged and retried next tick; never fatal
//! - Ready callbacks run on their own task so a slow callback cannot delay
//!   the next publish

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::config::DirectoryConfig;
use crate::directory::key::directory_key;
use crate::observability::metrics;
use crate::routing::Pattern;
use crate::store::{CoordinationStore, StoreError};

/// One-shot notification after the service became discoverable.
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Writes this process's directory entries.
pub struct DirectoryPublisher {
    store: Arc<dyn CoordinationStore>,
    keys: Vec<String>,
    address: String,
    lease_ttl: Duration,
    interval: Duration,
    ready_grace: Duration,
    ready: Mutex<Vec<ReadyCallback>>,
}

impl DirectoryPublisher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: &DirectoryConfig,
        host_id: &str,
        address: impl Into<String>,
        patterns: &[Pattern],
        ready: Vec<ReadyCallback>,
    ) -> Self {
        let keys = patterns
            .iter()
            .map(|pattern| directory_key(&config.root, pattern, host_id))
            .collect();
        Self {
            store,
            keys,
            address: address.into(),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
            interval: Duration::from_millis(config.publish_interval_ms),
            ready_grace: Duration::from_millis(config.ready_grace_ms),
            ready: Mutex::new(ready),
        }
    }

    /// Write every entry once. Errors with the first failure after trying all.
    pub async fn publish_once(&self) -> Result<usize, StoreError> {
        let mut first_error = None;
        let mut written = 0;
        for key in &self.keys {
            match self.store.set(key, &self.address, self.lease_ttl).await {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Directory write failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Publish every interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut announced = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    tracing::debug!("Publisher received shutdown signal, exiting loop");
                    break;
                }
            }

            match self.publish_once().await {
                Ok(written) => {
                    metrics::record_publish(true);
                    tracing::trace!(written, address = %self.address, "Directory entries refreshed");
                    if !announced {
                        announced = true;
                        tracing::info!(
                            patterns = written,
                            address = %self.address,
                            "Patterns published"
                        );
                        self.schedule_ready();
                    }
                }
                Err(e) => {
                    metrics::record_publish(false);
                    tracing::warn!(error = %e, "Directory publish failed, retrying next cycle");
                }
            }
        }
    }

    fn schedule_ready(&self) {
        let callbacks = std::mem::take(&mut *self.ready.lock().unwrap_or_else(PoisonError::into_inner));
        if callbacks.is_empty() {
            return;
        }
        let grace = self.ready_grace;
        tokio::spawn(async move {
            time::sleep(grace).await;
            tracing::debug!(callbacks = callbacks.len(), "Running ready callbacks");
            for callback in callbacks {
                callback();
            }
        });
    }
}

impl std::fmt::Debug for DirectoryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryPublisher")
            .field("keys", &self.keys)
            .field("address", &self.address)
            .field("lease_ttl", &self.lease_ttl)
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> DirectoryConfig {
        DirectoryConfig {
            publish_interval_ms: 100,
            lease_ttl_secs: 1,
            ready_grace_ms: 50,
            ..DirectoryConfig::default()
        }
    }

    fn publisher(store: &MemoryStore, ready: Vec<ReadyCallback>) -> Arc<DirectoryPublisher> {
        let patterns = [
            Pattern::parse("role:adder").unwrap(),
            Pattern::parse("role:echo").unwrap(),
        ];
        Arc::new(DirectoryPublisher::new(
            Arc::new(store.clone()),
            &config(),
            "h1",
            "mem://h1:1",
            &patterns,
            ready,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_once_writes_every_pattern() {
        let store = MemoryStore::new();
        let publisher = publisher(&store, Vec::new());
        assert_eq!(publisher.publish_once().await.unwrap(), 2);
        let key = directory_key("/micro", &Pattern::parse("role:adder").unwrap(), "h1");
        assert_eq!(store.get(&key).as_deref(), Some("mem://h1:1"));

        store.set_available(false);
        assert!(matches!(publisher.publish_once().await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_lease_alive_and_ready_fires_once() {
        let store = MemoryStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let publisher = publisher(
            &store,
            vec![Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })],
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(publisher.run(shutdown_rx));

        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.len(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Well past the 1s lease: refreshed every 100ms, never expired.
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.reap(), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_waits_for_first_successful_cycle() {
        let store = MemoryStore::new();
        store.set_available(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let publisher = publisher(
            &store,
            vec![Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })],
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(publisher.run(shutdown_rx));

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!task.is_finished());

        store.set_available(true);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 2);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
