//! Directory watch task.
//!
//! # Responsibilities
//! - Feed watch events from the coordination store into the directory
//! - Bootstrap from a listing so late joiners see existing peers
//! - Prune lapsed leases on a fixed cadence
//! - Re-establish the watch after failures
//!
//! # Design Decisions
//! - Watch first, then list: nothing written between the two is missed, and
//!   applying a listed entry twice is harmless
//! - Every listing is reconciled against the directory, so removals that
//!   happened while the watch was down do not linger
//! - Directory locks are held only while applying one event

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::directory::ServiceDirectory;
use crate::store::{CoordinationStore, StoreError, WatchEvent, WatchStream};

/// Keeps a [`ServiceDirectory`] in sync with the store.
pub struct DirectoryWatcher {
    store: Arc<dyn CoordinationStore>,
    directory: Arc<RwLock<ServiceDirectory>>,
    root: String,
    retry: Duration,
    prune_every: Duration,
}

impl DirectoryWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: Arc<RwLock<ServiceDirectory>>,
        root: impl Into<String>,
        retry: Duration,
        prune_every: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            root: root.into(),
            retry,
            prune_every,
        }
    }

    fn apply(&self, event: &WatchEvent) {
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(event);
    }

    fn prune(&self) {
        let pruned = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_expired(Instant::now());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned lapsed directory entries");
        }
    }

    /// Open the watch and reconcile against the current listing.
    async fn establish(&self) -> Result<WatchStream, StoreError> {
        let events = self.store.watch(&self.root).await?;
        let entries = self.store.list(&self.root).await?;
        let dropped = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reconcile(&entries);
        tracing::debug!(root = %self.root, entries = entries.len(), dropped, "Directory watch established");
        Ok(events)
    }

    /// Follow the store until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut prune = time::interval(self.prune_every);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let established = tokio::select! {
                result = self.establish() => result,
                _ = shutdown.recv() => break,
            };

            match established {
                Ok(mut events) => loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => self.apply(&event),
                            None => {
                                tracing::warn!(root = %self.root, "Directory watch ended, re-establishing");
                                break;
                            }
                        },
                        _ = prune.tick() => self.prune(),
                        _ = shutdown.recv() => {
                            tracing::debug!("Directory watcher received shutdown signal, exiting loop");
                            return;
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(root = %self.root, error = %e, retry_ms = self.retry.as_millis() as u64, "Directory watch failed");
                }
            }

            let retry = time::sleep(self.retry);
            tokio::pin!(retry);
            loop {
                tokio::select! {
                    _ = &mut retry => break,
                    _ = prune.tick() => self.prune(),
                    _ = shutdown.recv() => return,
                }
            }
        }
    }
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("root", &self.root)
            .field("retry", &self.retry)
            .finish()
    }
}
