//! Service instance: registration, startup, outbound send and teardown.
//!
//! # Responsibilities
//! - Collect prefix, handlers and ready callbacks before start
//! - Bind the inbound endpoint and spawn the background tasks
//! - Route outbound messages through directory, pool and request table
//! - Stop every task and settle pending requests on shutdown
//!
//! # Design Decisions
//! - All routing and connection state is owned by one instance; several
//!   instances may live in one process
//! - Handlers are fixed once the service starts
//! - Unroutable sends fail before any pending request or socket exists
//!
//! # Data Flow
//! ```text
//! send(message)
//!     → directory.route()        (none → Unroutable)
//!     → pool.outbound(address)
//!     → requests.register(id, timeout)
//!     → push [meta, message]
//!     → reply | timeout | send error | Closed
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::validation::{validate_config, ValidationError};
use crate::config::MeshConfig;
use crate::directory::{DirectoryPublisher, DirectoryWatcher, ReadyCallback, ServiceDirectory};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::routing::pattern::canonical_json;
use crate::routing::{Pattern, PatternError, PatternIndex};
use crate::rpc::{handler_fn, BoxError, Dispatcher, Envelope, Handler, RequestId, RequestTable, RpcError};
use crate::store::CoordinationStore;
use crate::transport::{advertised_address, ConnectionPool, Transport, TransportError};

/// Errors starting a service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {}", join_errors(.0))]
    Config(Vec<ValidationError>),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Collects registrations for a service that has not started yet.
pub struct ServiceBuilder {
    config: MeshConfig,
    prefix: Pattern,
    handlers: PatternIndex<Handler>,
    ready: Vec<ReadyCallback>,
}

impl ServiceBuilder {
    fn new(config: MeshConfig) -> Self {
        Self {
            config,
            prefix: Pattern::empty(),
            handlers: PatternIndex::new(),
            ready: Vec::new(),
        }
    }

    /// Constraints merged into every pattern registered afterwards.
    pub fn set_prefix(&mut self, prefix: &str) -> Result<&mut Self, PatternError> {
        self.prefix = Pattern::parse(prefix)?;
        Ok(self)
    }

    /// Serve messages matching `pattern` with `handler`.
    ///
    /// Registering the same pattern twice keeps one entry; the later handler
    /// wins.
    pub fn register_handler<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, PatternError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let pattern = Pattern::parse(pattern)?.with_prefix(&self.prefix);
        if !self.handlers.add(pattern.clone(), handler_fn(handler)) {
            tracing::warn!(pattern = %pattern, "Pattern registered twice, replacing handler");
        }
        Ok(self)
    }

    /// Run `callback` once the service's patterns are discoverable.
    pub fn on_ready<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.ready.push(Box::new(callback));
        self
    }

    /// Patterns registered so far, prefix applied.
    pub fn patterns(&self) -> Vec<Pattern> {
        self.handlers.patterns()
    }

    /// Bind, spawn the background tasks and start serving.
    pub async fn start(
        self,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<MicroService, ServiceError> {
        let config = self.config;
        validate_config(&config).map_err(ServiceError::Config)?;

        let host_id = if config.host_id.is_empty() {
            Uuid::new_v4().simple().to_string()
        } else {
            config.host_id.clone()
        };

        let endpoint = transport.endpoint(&config.listener.host, config.listener.port);
        let inbound = transport.bind(&endpoint).await?;
        let address = advertised_address(&inbound.endpoint, &config.listener.external_ip)?;

        let shutdown = Arc::new(Shutdown::new());
        let requests = Arc::new(RequestTable::new());
        let pool = Arc::new(ConnectionPool::new(transport));
        let directory = Arc::new(RwLock::new(ServiceDirectory::new(
            config.directory.root.clone(),
            Duration::from_secs(config.directory.lease_ttl_secs),
        )));

        let patterns = self.handlers.patterns();
        let dispatcher = Arc::new(Dispatcher::new(
            self.handlers,
            requests.clone(),
            pool.clone(),
            address.clone(),
        ));
        let publisher = Arc::new(DirectoryPublisher::new(
            store.clone(),
            &config.directory,
            &host_id,
            address.clone(),
            &patterns,
            self.ready,
        ));
        let watcher = DirectoryWatcher::new(
            store,
            directory.clone(),
            config.directory.root.clone(),
            Duration::from_millis(config.directory.watch_retry_ms),
            Duration::from_millis(config.directory.publish_interval_ms),
        );

        let tasks = vec![
            tokio::spawn(dispatcher.run(inbound.frames, shutdown.subscribe())),
            tokio::spawn(
                requests
                    .clone()
                    .run_sweeper(Duration::from_millis(config.requests.sweep_interval_ms), shutdown.subscribe()),
            ),
            tokio::spawn(publisher.run(shutdown.subscribe())),
            tokio::spawn(watcher.run(shutdown.subscribe())),
        ];

        tracing::info!(
            host_id = %host_id,
            address = %address,
            patterns = patterns.len(),
            "Service started"
        );

        Ok(MicroService {
            host_id,
            address,
            timeout: Duration::from_millis(config.requests.timeout_ms),
            directory,
            requests,
            pool,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

impl std::fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("prefix", &self.prefix)
            .field("handlers", &self.handlers.patterns())
            .field("ready", &self.ready.len())
            .finish()
    }
}

/// A running service instance.
pub struct MicroService {
    host_id: String,
    address: String,
    timeout: Duration,
    directory: Arc<RwLock<ServiceDirectory>>,
    requests: Arc<RequestTable>,
    pool: Arc<ConnectionPool>,
    shutdown: Arc<Shutdown>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MicroService {
    pub fn builder(config: MeshConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Send `message` to a peer serving it and await the reply.
    pub async fn send(&self, message: Value) -> Result<Value, RpcError> {
        self.send_with_timeout(message, self.timeout).await
    }

    /// As [`send`](Self::send) with an explicit deadline.
    pub async fn send_with_timeout(&self, message: Value, timeout: Duration) -> Result<Value, RpcError> {
        if self.shutdown.is_triggered() {
            return Err(RpcError::Closed);
        }

        let route = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .route(&message);
        let Some((pattern, address)) = route else {
            metrics::record_unroutable();
            return Err(RpcError::Unroutable {
                message: canonical_json(&message),
            });
        };

        let start = std::time::Instant::now();
        let result = self.deliver(&pattern, &address, message, timeout).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        metrics::record_request(outcome, start);
        result
    }

    async fn deliver(
        &self,
        pattern: &Pattern,
        address: &str,
        message: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let socket = self.pool.outbound(address).await?;

        let request_id = RequestId::generate();
        let frame = Envelope::Request {
            request_id: request_id.clone(),
            return_address: self.address.clone(),
        }
        .encode(&message)
        .map_err(|e| RpcError::Codec(e.to_string()))?;

        let reply = self.requests.register(request_id.clone(), timeout);
        tracing::trace!(request_id = %request_id, pattern = %pattern, address, "Sending request");
        if let Err(e) = socket.send(frame).await {
            tracing::warn!(request_id = %request_id, address, error = %e, "Request send failed");
            self.pool.evict(address);
            self.requests.reject(&request_id, RpcError::Transport(e));
        }

        reply.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Inbound address advertised to peers.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Live (host, address) pairs serving `pattern`.
    pub fn hosts_for(&self, pattern: &Pattern) -> Vec<(String, String)> {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hosts_for(pattern)
    }

    /// Whether some live peer pattern matches `message`.
    pub fn is_routable(&self, message: &Value) -> bool {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .route(message)
            .is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn open_connections(&self) -> usize {
        self.pool.len()
    }

    /// Stop every background task and settle pending requests with `Closed`.
    pub async fn shutdown(&self) {
        if self.shutdown.trigger() {
            tracing::info!(host_id = %self.host_id, "Service shutting down");
        }
        self.requests.close();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Service task failed");
            }
        }
    }
}

impl Drop for MicroService {
    fn drop(&mut self) {
        self.shutdown.trigger();
        self.requests.close();
    }
}

impl std::fmt::Debug for MicroService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroService")
            .field("host_id", &self.host_id)
            .field("address", &self.address)
            .field("pending_requests", &self.requests.len())
            .field("open_connections", &self.pool.len())
            .finish()
    }
}
