//! Inbound message loop.
//!
//! # Responsibilities
//! - Decode every frame received on the service's pull socket
//! - Settle pending requests from reply envelopes
//! - Route request envelopes to the most specific local handler
//! - Send exactly one reply per decoded request
//!
//! # Design Decisions
//! - Handlers run on their own task so a slow handler never stalls the loop
//! - Handler errors and panics become reply errors; the loop never dies
//! - Undecodable frames are logged and dropped, never answered
//! - The handler index is frozen at start; lookups take no lock

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::observability::metrics;
use crate::routing::PatternIndex;
use crate::rpc::envelope::{Envelope, ReplyError, ReplyErrorKind, RequestId};
use crate::rpc::error::{BoxError, RpcError};
use crate::rpc::requests::RequestTable;
use crate::transport::ConnectionPool;

/// Type-erased application handler.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Consumes inbound frames for one service instance.
pub struct Dispatcher {
    handlers: PatternIndex<Handler>,
    requests: Arc<RequestTable>,
    pool: Arc<ConnectionPool>,
    address: String,
}

impl Dispatcher {
    pub fn new(
        handlers: PatternIndex<Handler>,
        requests: Arc<RequestTable>,
        pool: Arc<ConnectionPool>,
        address: String,
    ) -> Self {
        Self {
            handlers,
            requests,
            pool,
            address,
        }
    }

    /// Process frames in received order until shutdown or the socket closes.
    pub async fn run(self: Arc<Self>, mut frames: mpsc::Receiver<Vec<u8>>, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(address = %self.address, handlers = self.handlers.len(), "Dispatcher started");
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.dispatch(&frame),
                    None => {
                        tracing::debug!("Inbound socket closed, dispatcher exiting");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::debug!("Dispatcher received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Handle one raw frame.
    pub fn dispatch(self: &Arc<Self>, frame: &[u8]) {
        let (envelope, message) = match Envelope::decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, size = frame.len(), "Dropping undecodable frame");
                metrics::record_frame_dropped("undecodable");
                return;
            }
        };

        match envelope {
            Envelope::Reply { request_id, error, .. } => self.settle_reply(&request_id, error, message),
            Envelope::Request {
                request_id,
                return_address,
            } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.handle_request(request_id, return_address, message).await;
                });
            }
        }
    }

    fn settle_reply(&self, request_id: &RequestId, error: Option<ReplyError>, message: Value) {
        let settled = match error {
            Some(error) => self.requests.reject(request_id, RpcError::from(error)),
            None => self.requests.resolve(request_id, message),
        };
        if !settled {
            tracing::debug!(request_id = %request_id, "Dropping late or duplicate reply");
            metrics::record_frame_dropped("unmatched_reply");
        }
    }

    async fn handle_request(&self, request_id: RequestId, return_address: String, message: Value) {
        let outcome = self.invoke(&request_id, message).await;
        let (reply, error, label) = match outcome {
            Ok(value) => (value, None, "handled"),
            Err(error) => {
                let label = match error.kind {
                    ReplyErrorKind::NoHandler => "no_handler",
                    ReplyErrorKind::Handler => "handler_error",
                };
                (Value::Null, Some(error), label)
            }
        };
        metrics::record_dispatch(label);

        let envelope = Envelope::Reply {
            request_id: request_id.clone(),
            return_address: self.address.clone(),
            error,
        };
        let frame = match envelope.encode(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Failed to encode reply");
                return;
            }
        };

        let socket = match self.pool.reply_channel(&return_address).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(request_id = %request_id, return_address = %return_address, error = %e, "Reply channel unavailable");
                return;
            }
        };
        if let Err(e) = socket.send(frame).await {
            tracing::warn!(request_id = %request_id, return_address = %return_address, error = %e, "Failed to send reply");
            self.pool.evict(&return_address);
        }
    }

    async fn invoke(&self, request_id: &RequestId, message: Value) -> Result<Value, ReplyError> {
        let (pattern, handler) = match self.handlers.lookup(&message) {
            Some((pattern, handler)) => (pattern.clone(), Arc::clone(handler)),
            None => {
                tracing::debug!(request_id = %request_id, "No local handler matches request");
                return Err(ReplyError::no_handler(format!(
                    "no handler for {}",
                    crate::routing::pattern::canonical_json(&message)
                )));
            }
        };

        tracing::trace!(request_id = %request_id, pattern = %pattern, "Invoking handler");
        // The call itself may panic before any future exists.
        match AssertUnwindSafe(async move { handler(message).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::debug!(request_id = %request_id, pattern = %pattern, error = %e, "Handler failed");
                Err(ReplyError::handler(e.to_string()))
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                tracing::error!(request_id = %request_id, pattern = %pattern, reason = %reason, "Handler panicked");
                Err(ReplyError::handler(reason))
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("address", &self.address)
            .field("handlers", &self.handlers.patterns())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Pattern;
    use crate::transport::{MemoryTransport, Transport};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        requests: Arc<RequestTable>,
        transport: MemoryTransport,
    }

    fn harness(handlers: PatternIndex<Handler>) -> Harness {
        let transport = MemoryTransport::new();
        let requests = Arc::new(RequestTable::new());
        let pool = Arc::new(ConnectionPool::new(Arc::new(transport.clone())));
        let dispatcher = Arc::new(Dispatcher::new(
            handlers,
            requests.clone(),
            pool,
            "mem://server:1".to_string(),
        ));
        Harness {
            dispatcher,
            requests,
            transport,
        }
    }

    fn adder() -> PatternIndex<Handler> {
        let mut handlers = PatternIndex::new();
        handlers.add(
            Pattern::parse("role:adder").unwrap(),
            handler_fn(|msg: Value| async move {
                let a = msg["a"].as_i64().ok_or("missing a")?;
                let b = msg["b"].as_i64().ok_or("missing b")?;
                Ok::<_, BoxError>(json!({"sum": a + b}))
            }),
        );
        handlers.add(
            Pattern::parse("role:adder,cmd:panic").unwrap(),
            handler_fn(explode),
        );
        handlers.add(
            Pattern::parse("role:adder,cmd:eager").unwrap(),
            handler_fn(|msg: Value| {
                let strict = msg["strict"].as_bool().unwrap();
                async move { Ok::<_, BoxError>(json!({"strict": strict})) }
            }),
        );
        handlers
    }

    async fn explode(_message: Value) -> Result<Value, BoxError> {
        panic!("kaboom")
    }

    async fn request(h: &Harness, message: Value) -> (Envelope, Value) {
        let mut inbound = h.transport.bind("mem://client:0").await.unwrap();
        let frame = Envelope::Request {
            request_id: RequestId::from("r1"),
            return_address: inbound.endpoint.clone(),
        }
        .encode(&message)
        .unwrap();
        h.dispatcher.dispatch(&frame);

        let reply = tokio::time::timeout(Duration::from_secs(5), inbound.frames.recv())
            .await
            .unwrap()
            .unwrap();
        Envelope::decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_request_gets_handler_result() {
        let h = harness(adder());
        let (envelope, message) = request(&h, json!({"role": "adder", "a": 2, "b": 3})).await;
        assert_eq!(
            envelope,
            Envelope::Reply {
                request_id: RequestId::from("r1"),
                return_address: "mem://server:1".to_string(),
                error: None,
            }
        );
        assert_eq!(message, json!({"sum": 5}));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_reply_error() {
        let h = harness(adder());
        let (envelope, _) = request(&h, json!({"role": "adder", "a": 2})).await;
        match envelope {
            Envelope::Reply { error: Some(error), .. } => {
                assert_eq!(error, ReplyError::handler("missing b"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let h = harness(adder());
        let (envelope, _) = request(&h, json!({"role": "adder", "cmd": "panic"})).await;
        match envelope {
            Envelope::Reply { error: Some(error), .. } => assert_eq!(error, ReplyError::handler("kaboom")),
            other => panic!("unexpected {:?}", other),
        }

        // The dispatcher still serves later requests.
        let (_, message) = request(&h, json!({"role": "adder", "a": 1, "b": 1})).await;
        assert_eq!(message, json!({"sum": 2}));
    }

    #[tokio::test]
    async fn test_handler_panic_before_future_is_contained() {
        let h = harness(adder());
        let (envelope, _) = request(&h, json!({"role": "adder", "cmd": "eager"})).await;
        match envelope {
            Envelope::Reply { error: Some(error), .. } => {
                assert_eq!(error.kind, ReplyErrorKind::Handler);
            }
            other => panic!("unexpected {:?}", other),
        }

        let (_, message) = request(&h, json!({"role": "adder", "a": 4, "b": 4})).await;
        assert_eq!(message, json!({"sum": 8}));
    }

    #[tokio::test]
    async fn test_unmatched_request_gets_no_handler() {
        let h = harness(adder());
        let (envelope, _) = request(&h, json!({"role": "multiplier"})).await;
        match envelope {
            Envelope::Reply { error: Some(error), .. } => {
                assert_eq!(error.kind, ReplyErrorKind::NoHandler);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replies_settle_pending_requests() {
        let h = harness(PatternIndex::new());
        let ok = h.requests.register(RequestId::from("ok"), Duration::from_secs(5));
        let failed = h.requests.register(RequestId::from("failed"), Duration::from_secs(5));

        let reply = |id: &str, error: Option<ReplyError>, message: Value| {
            Envelope::Reply {
                request_id: RequestId::from(id),
                return_address: "mem://peer:1".to_string(),
                error,
            }
            .encode(&message)
            .unwrap()
        };

        // Out of order, with a duplicate and an unknown id.
        h.dispatcher.dispatch(&reply("failed", Some(ReplyError::handler("nope")), Value::Null));
        h.dispatcher.dispatch(&reply("ok", None, json!({"sum": 5})));
        h.dispatcher.dispatch(&reply("ok", None, json!({"sum": 6})));
        h.dispatcher.dispatch(&reply("ghost", None, json!(1)));
        h.dispatcher.dispatch(b"garbage");

        assert_eq!(ok.await.unwrap().unwrap(), json!({"sum": 5}));
        assert!(matches!(failed.await.unwrap(), Err(RpcError::Handler(ref m)) if m == "nope"));
        assert!(h.requests.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(PatternIndex::new());
        let (_tx, frames) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(h.dispatcher.clone().run(frames, shutdown_rx));
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
