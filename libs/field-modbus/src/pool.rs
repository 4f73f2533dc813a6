//! Connection pool and request queue
//!
//! One entry per [`ConnectionKey`]. Each entry owns a worker task that holds
//! the key's session and drains a FIFO queue one request at a time, so a
//! session never carries two requests concurrently. Different keys proceed in
//! parallel.
//!
//! Retry policy per request:
//! - transport faults drop the session and reconnect after an exponential
//!   backoff, up to the connection's reconnect cap
//! - protocol and validation faults fail immediately
//! - any other fault retries immediately
//!
//! all within the request's retry budget.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use errors::{validation_error, FieldError, FieldResult};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, ReconnectTracker};
use crate::constants::{MAX_UNIT_ID, MIN_UNIT_ID};
use crate::request::{Request, RequestOptions, Response};
use crate::transport::{ConnectionKey, Connector, Session};

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on simultaneously pooled keys
    pub max_connections: usize,
    /// Connections idle this long are closed by the sweeper
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect: BackoffPolicy,
    /// Reconnect attempts before a connection is abandoned (0 = unlimited)
    pub max_reconnect_attempts: u32,
    pub min_unit_id: u8,
    pub max_unit_id: u8,
    /// Options used by [`ConnectionPool::execute`]
    pub defaults: RequestOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(3),
            reconnect: BackoffPolicy::from_millis(1000, 30_000),
            max_reconnect_attempts: 5,
            min_unit_id: MIN_UNIT_ID,
            max_unit_id: MAX_UNIT_ID,
            defaults: RequestOptions::default(),
        }
    }
}

/// Snapshot of one pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    pub connected: bool,
    pub busy: bool,
    pub queue_depth: usize,
    pub idle_ms: u64,
    pub reconnect_attempts: u32,
    pub requests_served: u64,
    pub failures: u64,
}

struct QueuedRequest {
    request: Request,
    options: RequestOptions,
    /// `None` for fire-and-forget writes
    reply: Option<oneshot::Sender<FieldResult<Response>>>,
}

struct ConnectionStats {
    connected: AtomicBool,
    busy: AtomicBool,
    queue_depth: AtomicUsize,
    last_activity: Mutex<Instant>,
    reconnect_attempts: AtomicU32,
    served: AtomicU64,
    failures: AtomicU64,
}

impl ConnectionStats {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            reconnect_attempts: AtomicU32::new(0),
            served: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn is_quiet(&self) -> bool {
        !self.busy.load(Ordering::SeqCst) && self.queue_depth.load(Ordering::SeqCst) == 0
    }
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    fn info(&self, key: &ConnectionKey) -> ConnectionInfo {
        let s = &self.stats;
        ConnectionInfo {
            key: key.clone(),
            connected: s.connected.load(Ordering::SeqCst),
            busy: s.busy.load(Ordering::SeqCst),
            queue_depth: s.queue_depth.load(Ordering::SeqCst),
            idle_ms: s.idle_for().as_millis() as u64,
            reconnect_attempts: s.reconnect_attempts.load(Ordering::SeqCst),
            requests_served: s.served.load(Ordering::SeqCst),
            failures: s.failures.load(Ordering::SeqCst),
        }
    }

    /// Stop the worker and wait for it to close its session
    async fn close(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Connection worker ended abnormally: {}", e);
            }
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    connections: DashMap<ConnectionKey, Arc<ConnectionHandle>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Pool of Modbus sessions with per-key request serialization.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create the pool and start its idle sweeper. Must be called inside a
    /// tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            connector,
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        spawn_sweeper(Arc::downgrade(&inner), inner.shutdown.clone(), inner.config.sweep_interval);
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Execute with the pool's default timeout and retry budget
    pub async fn execute(&self, key: &ConnectionKey, request: Request) -> FieldResult<Response> {
        self.execute_with(key, request, self.inner.config.defaults).await
    }

    /// Queue `request` on the key's connection and wait for its result
    pub async fn execute_with(
        &self,
        key: &ConnectionKey,
        request: Request,
        options: RequestOptions,
    ) -> FieldResult<Response> {
        self.validate(key, &request)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(
            key,
            QueuedRequest {
                request,
                options,
                reply: Some(reply_tx),
            },
        )?;

        reply_rx
            .await
            .map_err(|_| FieldError::Shutdown(format!("connection {} closed", key)))?
    }

    /// Queue a write without waiting for the device to acknowledge it.
    /// Failures are only logged.
    pub fn write_fire_and_forget(&self, key: &ConnectionKey, request: Request) -> FieldResult<()> {
        if !request.is_write() {
            return Err(validation_error!(
                "{} is not a write request",
                request.function_code()
            ));
        }
        self.validate(key, &request)?;
        self.enqueue(
            key,
            QueuedRequest {
                request,
                options: self.inner.config.defaults,
                reply: None,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().info(entry.key()))
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    pub fn status_of(&self, key: &ConnectionKey) -> Option<ConnectionInfo> {
        self.inner.connections.get(key).map(|h| h.info(key))
    }

    /// Close one connection. Queued requests fail with a shutdown error.
    pub async fn disconnect(&self, key: &ConnectionKey) -> bool {
        match self.inner.connections.remove(key) {
            Some((_, handle)) => {
                handle.close().await;
                info!("Disconnected {}", key);
                true
            },
            None => false,
        }
    }

    /// Close every connection and stop the sweeper. In-flight requests
    /// finish; queued ones fail. Later calls are rejected.
    pub async fn shutdown_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();

        let keys: Vec<ConnectionKey> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let handles: Vec<Arc<ConnectionHandle>> = keys
            .iter()
            .filter_map(|key| self.inner.connections.remove(key).map(|(_, h)| h))
            .collect();

        let count = handles.len();
        join_all(handles.iter().map(|h| h.close())).await;
        info!("Connection pool shut down ({} connections closed)", count);
    }

    /// Close connections idle longer than the configured window
    pub async fn sweep_idle(&self) -> usize {
        sweep(&self.inner).await
    }

    fn validate(&self, key: &ConnectionKey, request: &Request) -> FieldResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(FieldError::Shutdown("connection pool closed".to_string()));
        }
        let cfg = &self.inner.config;
        if key.unit_id < cfg.min_unit_id || key.unit_id > cfg.max_unit_id {
            return Err(FieldError::out_of_range(
                "unit_id",
                key.unit_id,
                cfg.min_unit_id,
                cfg.max_unit_id,
            ));
        }
        request.validate()
    }

    fn enqueue(&self, key: &ConnectionKey, mut queued: QueuedRequest) -> FieldResult<()> {
        // A handle can close between lookup and send (eviction); retry once
        // with a fresh one.
        for _ in 0..2 {
            let handle = self.handle_for(key)?;
            handle.stats.queue_depth.fetch_add(1, Ordering::SeqCst);
            match handle.tx.send(queued) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    handle.stats.queue_depth.fetch_sub(1, Ordering::SeqCst);
                    self.inner
                        .connections
                        .remove_if(key, |_, current| Arc::ptr_eq(current, &handle));
                    queued = returned;
                },
            }
        }
        Err(FieldError::Shutdown(format!("connection {} closed", key)))
    }

    fn handle_for(&self, key: &ConnectionKey) -> FieldResult<Arc<ConnectionHandle>> {
        if let Some(handle) = self.inner.connections.get(key) {
            return Ok(Arc::clone(handle.value()));
        }

        if self.inner.connections.len() >= self.inner.config.max_connections {
            self.evict_one()?;
        }

        let handle = self
            .inner
            .connections
            .entry(key.clone())
            .or_insert_with(|| spawn_worker(&self.inner, key.clone()))
            .clone();
        Ok(handle)
    }

    /// Drop the quiet connection with the oldest activity
    fn evict_one(&self) -> FieldResult<()> {
        let victim = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.value().stats.is_quiet())
            .max_by_key(|entry| entry.value().stats.idle_for())
            .map(|entry| entry.key().clone());

        let Some(victim) = victim else {
            return Err(FieldError::ResourceBusy(format!(
                "connection pool full ({} connections, all busy)",
                self.inner.config.max_connections
            )));
        };

        if let Some((_, handle)) = self.inner.connections.remove(&victim) {
            info!("Evicting idle connection {} (pool full)", victim);
            handle.cancel.cancel();
        }
        Ok(())
    }
}

fn spawn_worker(inner: &PoolInner, key: ConnectionKey) -> Arc<ConnectionHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(ConnectionStats::new());
    let cancel = inner.shutdown.child_token();

    let worker = Worker {
        key,
        connector: Arc::clone(&inner.connector),
        config: inner.config.clone(),
        stats: Arc::clone(&stats),
        cancel: cancel.clone(),
        session: None,
        reconnect: ReconnectTracker::new(
            inner.config.reconnect,
            inner.config.max_reconnect_attempts,
        ),
    };
    let join = tokio::spawn(worker.run(rx));

    Arc::new(ConnectionHandle {
        tx,
        stats,
        cancel,
        worker: Mutex::new(Some(join)),
    })
}

fn spawn_sweeper(pool: Weak<PoolInner>, shutdown: CancellationToken, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = pool.upgrade() else { break };
                    sweep(&inner).await;
                }
            }
        }
        debug!("Idle sweeper stopped");
    });
}

async fn sweep(inner: &PoolInner) -> usize {
    let idle_timeout = inner.config.idle_timeout;
    let idle: Vec<ConnectionKey> = inner
        .connections
        .iter()
        .filter(|entry| {
            let stats = &entry.value().stats;
            stats.is_quiet() && stats.idle_for() >= idle_timeout
        })
        .map(|entry| entry.key().clone())
        .collect();

    let mut closed = 0;
    for key in idle {
        let removed = inner
            .connections
            .remove_if(&key, |_, handle| handle.stats.is_quiet());
        if let Some((_, handle)) = removed {
            handle.close().await;
            debug!("Closed idle connection {}", key);
            closed += 1;
        }
    }
    closed
}

/// Owns one key's session and drains its queue
struct Worker {
    key: ConnectionKey,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
    session: Option<Box<dyn Session>>,
    reconnect: ReconnectTracker,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueuedRequest>) {
        debug!("Connection worker started for {}", self.key);
        loop {
            let queued = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };

            self.stats.queue_depth.fetch_sub(1, Ordering::SeqCst);
            self.stats.busy.store(true, Ordering::SeqCst);
            let result = self.execute(&queued.request, queued.options).await;
            self.stats.touch();
            self.stats.busy.store(false, Ordering::SeqCst);

            match &result {
                Ok(_) => self.stats.served.fetch_add(1, Ordering::SeqCst),
                Err(_) => self.stats.failures.fetch_add(1, Ordering::SeqCst),
            };

            match queued.reply {
                Some(reply) => {
                    // Caller may have given up waiting
                    let _ = reply.send(result);
                },
                None => {
                    if let Err(e) = result {
                        warn!("Unacknowledged write {} to {} failed: {}", queued.request, self.key, e);
                    }
                },
            }
        }

        rx.close();
        let mut dropped = 0;
        while let Ok(queued) = rx.try_recv() {
            self.stats.queue_depth.fetch_sub(1, Ordering::SeqCst);
            if let Some(reply) = queued.reply {
                let _ = reply.send(Err(FieldError::Shutdown(format!(
                    "connection {} closed",
                    self.key
                ))));
            }
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Failed {} queued requests for {} on close", dropped, self.key);
        }

        self.drop_session().await;
        debug!("Connection worker stopped for {}", self.key);
    }

    async fn execute(&mut self, request: &Request, options: RequestOptions) -> FieldResult<Response> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match timeout(options.timeout, self.attempt(request)).await {
                Ok(result) => result,
                Err(_) => Err(FieldError::Timeout(format!("{} {}", self.key, request))),
            };

            let err = match result {
                Ok(response) => {
                    self.reconnect.mark_connected();
                    self.stats.reconnect_attempts.store(0, Ordering::SeqCst);
                    return Ok(response);
                },
                Err(e) => e,
            };

            if err.is_connection_fault() {
                self.drop_session().await;
            }
            if !err.is_retryable() || attempt > options.retries {
                debug!("{} on {} failed after {} attempt(s): {}", request, self.key, attempt, err);
                return Err(err);
            }

            if err.is_connection_fault() {
                let Some(delay) = self.reconnect.on_fault() else {
                    warn!(
                        "Giving up on {} after {} reconnect attempts: {}",
                        self.key, self.config.max_reconnect_attempts, err
                    );
                    return Err(err);
                };
                self.stats
                    .reconnect_attempts
                    .store(self.reconnect.attempts(), Ordering::SeqCst);
                info!(
                    "Reconnecting to {} in {:?} (attempt {}): {}",
                    self.key,
                    delay,
                    self.reconnect.attempts(),
                    err
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(FieldError::Shutdown(format!("connection {} closed", self.key)));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                debug!("Retrying {} on {} after: {}", request, self.key, err);
            }
        }
    }

    async fn attempt(&mut self, request: &Request) -> FieldResult<Response> {
        if self.session.is_none() {
            let session = self
                .connector
                .connect(&self.key, self.config.connect_timeout)
                .await?;
            info!("Connected to {}", self.key);
            self.stats.connected.store(true, Ordering::SeqCst);
            self.session = Some(session);
        }

        match self.session.as_mut() {
            Some(session) => session.call(self.key.unit_id, request).await,
            None => Err(FieldError::NotConnected(self.key.to_string())),
        }
    }

    async fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            self.reconnect.mark_disconnected();
            self.stats.connected.store(false, Ordering::SeqCst);
        }
    }
}
