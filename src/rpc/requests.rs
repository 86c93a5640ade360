//! In-flight request table and expiry sweep.
//!
//! # Responsibilities
//! - Track outbound requests (id → reply continuation + deadline)
//! - Settle each request exactly once: reply, send error or timeout
//! - Sweep expired entries on a fixed cadence
//!
//! # Design Decisions
//! - Removal from the map is the single point of settlement; whoever removes
//!   the entry fires the continuation, everyone else is a no-op
//! - Replies are matched by id only, never by arrival order
//! - Deadlines use tokio's clock so tests can pause time

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::observability::metrics;
use crate::rpc::envelope::RequestId;
use crate::rpc::error::RpcError;

/// Outcome delivered to the caller of `send`.
pub type ReplyResult = Result<Value, RpcError>;

#[derive(Debug)]
struct Pending {
    tx: oneshot::Sender<ReplyResult>,
    issued_at: Instant,
    /// `None` when the deadline is past what the clock can represent.
    expires_at: Option<Instant>,
}

impl Pending {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Pending outbound requests.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: DashMap<RequestId, Pending>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` until settled or `ttl` elapses. A `ttl` too large for the
    /// clock never expires.
    pub fn register(&self, id: RequestId, ttl: Duration) -> oneshot::Receiver<ReplyResult> {
        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();
        self.pending.insert(
            id,
            Pending {
                tx,
                issued_at,
                expires_at: issued_at.checked_add(ttl),
            },
        );
        metrics::record_pending(self.pending.len());
        rx
    }

    /// Settle with a reply value. False when `id` is unknown.
    pub fn resolve(&self, id: &RequestId, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    /// Settle with an error. False when `id` is unknown.
    pub fn reject(&self, id: &RequestId, error: RpcError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &RequestId, result: ReplyResult) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => {
                // The caller may have stopped waiting; that is not our concern.
                let _ = pending.tx.send(result);
                metrics::record_pending(self.pending.len());
                true
            }
            None => false,
        }
    }

    /// Reject every entry whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for id in expired {
            if let Some((id, pending)) = self.pending.remove_if(&id, |_, p| p.expired(now)) {
                let after_ms = pending
                    .expires_at
                    .unwrap_or(now)
                    .saturating_duration_since(pending.issued_at)
                    .as_millis() as u64;
                tracing::debug!(request_id = %id, after_ms, "Request timed out");
                let _ = pending.tx.send(Err(RpcError::Timeout {
                    request_id: id.to_string(),
                    after_ms,
                }));
                count += 1;
            }
        }
        if count > 0 {
            metrics::record_pending(self.pending.len());
        }
        count
    }

    /// Reject everything still pending with `Closed`.
    pub fn close(&self) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.reject(id, RpcError::Closed)).count()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sweep every `every` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Request sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_fires_once() {
        let table = RequestTable::new();
        let id = RequestId::from("a");
        let rx = table.register(id.clone(), Duration::from_secs(5));

        assert!(table.resolve(&id, json!({"sum": 5})));
        assert!(!table.resolve(&id, json!({"sum": 6})));
        assert!(!table.reject(&id, RpcError::Closed));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"sum": 5}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_everything() {
        let table = RequestTable::new();
        let a = table.register(RequestId::from("a"), Duration::from_secs(5));
        let b = table.register(RequestId::from("b"), Duration::from_secs(5));
        assert_eq!(table.close(), 2);
        assert!(matches!(a.await.unwrap(), Err(RpcError::Closed)));
        assert!(matches!(b.await.unwrap(), Err(RpcError::Closed)));
        assert_eq!(table.close(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_noop() {
        let table = RequestTable::new();
        assert!(!table.resolve(&RequestId::from("ghost"), json!(null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_rejects_expired_only() {
        let table = RequestTable::new();
        let short = RequestId::from("short");
        let long = RequestId::from("long");
        let short_rx = table.register(short.clone(), Duration::from_millis(100));
        let _long_rx = table.register(long.clone(), Duration::from_millis(1000));

        time::advance(Duration::from_millis(99)).await;
        assert_eq!(table.sweep(Instant::now()), 0);

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(table.sweep(Instant::now()), 1);
        assert!(!table.contains(&short));
        assert!(table.contains(&long));

        match short_rx.await.unwrap() {
            Err(RpcError::Timeout { request_id, after_ms }) => {
                assert_eq!(request_id, "short");
                assert_eq!(after_ms, 100);
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        // A late reply after the timeout has no effect.
        assert!(!table.resolve(&short, json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let table = RequestTable::new();
        let id = RequestId::from("forever");
        let rx = table.register(id.clone(), Duration::MAX);

        time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert_eq!(table.sweep(Instant::now()), 0);
        assert!(table.contains(&id));

        assert!(table.resolve(&id, json!("late")));
        assert_eq!(rx.await.unwrap().unwrap(), json!("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_times_out_requests() {
        let table = Arc::new(RequestTable::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let sweeper = tokio::spawn(table.clone().run_sweeper(Duration::from_millis(25), shutdown_rx));

        let rx = table.register(RequestId::from("x"), Duration::from_millis(50));
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
        assert!(table.is_empty());

        shutdown_tx.send(()).unwrap();
        sweeper.await.unwrap();
    }
}
