//! In-process coordination store.
//!
//! Keeps entries with lease expiry and fans changes out to prefix watchers.
//! Several services in one process share a store by cloning it. Expiry is
//! evaluated lazily on every operation and by the optional reaper task.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::store::{under_prefix, CoordinationStore, StoreEntry, StoreError, WatchEvent, WatchStream};

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, StoredValue>,
    watchers: Vec<Watcher>,
    unavailable: bool,
}

impl MemoryState {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers
            .retain(|w| !under_prefix(&event.key, &w.prefix) || w.tx.send(event.clone()).is_ok());
    }

    fn reap(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| v.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
            self.notify(WatchEvent::expire(key.clone()));
        }
        expired.len()
    }
}

/// Shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Toggle availability. While unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    /// Close every open watch stream without touching the entries.
    pub fn drop_watches(&self) -> usize {
        std::mem::take(&mut self.state().watchers).len()
    }

    /// Remove `key`, notifying watchers. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state();
        if state.entries.remove(key).is_some() {
            state.notify(WatchEvent::delete(key));
            true
        } else {
            false
        }
    }

    /// Expire every entry whose lease has lapsed.
    pub fn reap(&self) -> usize {
        self.state().reap(Instant::now())
    }

    /// Current value of `key`, ignoring lapsed leases.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.state()
            .entries
            .get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| v.value.clone())
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reap on a fixed cadence until the store is dropped.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let expired = inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .reap(Instant::now());
                if expired > 0 {
                    tracing::debug!(expired, "Memory store expired leases");
                }
            }
        })
    }

    fn check_available(state: &MemoryState) -> Result<(), StoreError> {
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::check_available(&state)?;
        state.reap(now);
        state.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        state.notify(WatchEvent::set(key, value, Some(ttl)));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoreEntry>, StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::check_available(&state)?;
        state.reap(now);
        Ok(state
            .entries
            .iter()
            .filter(|(k, _)| under_prefix(k, prefix))
            .map(|(k, v)| StoreEntry::new(k.clone(), v.value.clone(), Some(v.expires_at - now)))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut state = self.state();
        Self::check_available(&state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WatchAction;

    #[tokio::test(start_paused = true)]
    async fn test_set_list_and_watch() {
        let store = MemoryStore::new();
        let mut events = store.watch("/micro").await.unwrap();

        store.set("/micro/a/h1", "tcp://1", Duration::from_secs(60)).await.unwrap();
        store.set("/other/x", "y", Duration::from_secs(60)).await.unwrap();

        let listed = store.list("/micro").await.unwrap();
        assert_eq!(
            listed,
            vec![StoreEntry::new("/micro/a/h1", "tcp://1", Some(Duration::from_secs(60)))]
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.action, WatchAction::Set);
        assert_eq!(event.key, "/micro/a/h1");
        assert_eq!(event.value.as_deref(), Some("tcp://1"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_emits_expire() {
        let store = MemoryStore::new();
        let mut events = store.watch("/micro").await.unwrap();
        store.set("/micro/a/h1", "tcp://1", Duration::from_secs(1)).await.unwrap();
        events.recv().await.unwrap();

        time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.reap(), 0);
        time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.reap(), 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event, WatchEvent::expire("/micro/a/h1"));
        assert!(store.get("/micro/a/h1").is_none());
    }

    #[tokio::test]
    async fn test_delete_and_availability() {
        let store = MemoryStore::new();
        let mut events = store.watch("/micro").await.unwrap();
        store.set("/micro/a/h1", "v", Duration::from_secs(60)).await.unwrap();
        assert!(store.delete("/micro/a/h1"));
        assert!(!store.delete("/micro/a/h1"));

        events.recv().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), WatchEvent::delete("/micro/a/h1"));

        store.set_available(false);
        assert!(matches!(
            store.set("/micro/a/h1", "v", Duration::from_secs(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.list("/micro").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_watches_closes_streams() {
        let store = MemoryStore::new();
        let mut events = store.watch("/micro").await.unwrap();
        assert_eq!(store.drop_watches(), 1);
        assert!(events.recv().await.is_none());
        assert_eq!(store.drop_watches(), 0);
    }
}
