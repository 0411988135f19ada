//! Local dispatch bus.
//!
//! `emit`/`publish` audit the event and queue it; a single background worker
//! drains the queue in FIFO order and invokes every matching handler. The
//! producer never waits on handler execution.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures_util::FutureExt;
use reflex_protocol::{Event, EventOptions, SchemaViolation, TopicPattern, make_event};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::config::BusConfig;
use crate::handler::{EventHandler, HandlerFailure};

type SharedHandler = Arc<dyn EventHandler>;
type DispatchQueue = mpsc::Receiver<Arc<Event>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Constructed, worker not running
    Disabled,
    Running,
    /// Worker running, kill switch engaged
    Muted,
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events accepted by `emit`/`publish` (muted or not)
    pub emitted: u64,
    /// Handler invocations, successful or not
    pub deliveries: u64,
    pub handler_failures: u64,
    /// Events not queued because the dispatch queue was full
    pub dropped: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("the dispatch worker needs a running tokio runtime")]
    NoRuntime,
    #[error("the dispatch queue is still held by a worker that is stopping")]
    QueueUnavailable,
    #[error("failed to open audit log: {0}")]
    Audit(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

// ============================================================================
// Routes
// ============================================================================

/// Exact-topic table plus a linear list of prefix patterns
#[derive(Default)]
struct Routes {
    exact: HashMap<String, Vec<SharedHandler>>,
    wildcard: Vec<(TopicPattern, SharedHandler)>,
}

impl Routes {
    fn insert(&mut self, pattern: TopicPattern, handler: SharedHandler) {
        match pattern {
            TopicPattern::Exact(topic) => self.exact.entry(topic).or_default().push(handler),
            prefix @ TopicPattern::Prefix(_) => self.wildcard.push((prefix, handler)),
        }
    }

    /// Every handler matching `topic`, labelled with the pattern it was registered on
    fn resolve(&self, topic: &str) -> Vec<(String, SharedHandler)> {
        let mut matched: Vec<(String, SharedHandler)> = self
            .exact
            .get(topic)
            .map(|handlers| handlers.iter().map(|h| (topic.to_string(), h.clone())).collect())
            .unwrap_or_default();

        for (pattern, handler) in &self.wildcard {
            if pattern.matches(topic) {
                matched.push((pattern.to_string(), handler.clone()));
            }
        }
        matched
    }

    fn len(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Link to the bridge: matching local events are copied here
struct OutboundLink {
    patterns: Vec<TopicPattern>,
    tx: mpsc::UnboundedSender<Event>,
}

struct Worker {
    queue: Option<DispatchQueue>,
    handle: Option<JoinHandle<DispatchQueue>>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    deliveries: AtomicU64,
    handler_failures: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    source: String,
    channel: String,
    routes: RwLock<Routes>,
    muted: AtomicBool,
    audit: AuditLog,
    queue_tx: mpsc::Sender<Arc<Event>>,
    worker: Mutex<Worker>,
    outbound: RwLock<Option<OutboundLink>>,
    counters: Counters,
}

/// Handle to an in-process event bus.
///
/// Cloning is cheap; all clones share the same routes, queue and worker.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Create a bus writing its audit log where `config.log_path` says
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        let audit = match &config.log_path {
            Some(path) => AuditLog::file(path)?,
            None => AuditLog::stdout(),
        };
        Ok(Self::with_audit(config, audit))
    }

    pub fn with_audit(config: BusConfig, audit: AuditLog) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));

        if config.muted {
            warn!("event bus created with kill switch engaged");
        }

        Self {
            inner: Arc::new(Inner {
                source: config.source,
                channel: config.channel,
                routes: RwLock::new(Routes::default()),
                muted: AtomicBool::new(config.muted),
                audit,
                queue_tx,
                worker: Mutex::new(Worker {
                    queue: Some(queue_rx),
                    handle: None,
                    shutdown: CancellationToken::new(),
                }),
                outbound: RwLock::new(None),
                counters: Counters::default(),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Register a handler on an exact topic or a `prefix*` pattern
    pub fn on<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(pattern, Arc::new(handler));
    }

    /// Register an async handler
    pub fn on_async(&self, pattern: &str, handler: impl EventHandler) {
        self.subscribe(pattern, Arc::new(handler));
    }

    fn subscribe(&self, pattern: &str, handler: SharedHandler) {
        let pattern = TopicPattern::parse(pattern);
        debug!(pattern = %pattern, wildcard = pattern.is_wildcard(), "registering event handler");
        self.inner.write_routes().insert(pattern, handler);
    }

    pub fn handler_count(&self) -> usize {
        self.inner.read_routes().len()
    }

    // ------------------------------------------------------------------------
    // Producing
    // ------------------------------------------------------------------------

    /// Build an event with the bus's default source and channel and publish it.
    ///
    /// Returns the event so callers can reference its id. Delivery problems
    /// never surface here: they end up in the audit log and `stats()`.
    pub fn emit(&self, topic: &str, payload: Value) -> Result<Event, SchemaViolation> {
        let event = make_event(
            topic,
            payload,
            self.inner.source.as_str(),
            self.inner.channel.as_str(),
            EventOptions::default(),
        )?;
        self.publish(event.clone());
        Ok(event)
    }

    /// Build an event with explicit provenance and options, then publish it
    pub fn emit_as(
        &self,
        source: &str,
        channel: &str,
        topic: &str,
        payload: Value,
        options: EventOptions,
    ) -> Result<Event, SchemaViolation> {
        let event = make_event(topic, payload, source, channel, options)?;
        self.publish(event.clone());
        Ok(event)
    }

    /// Publish a locally produced event
    pub fn publish(&self, event: Event) {
        self.inner.submit(event, Origin::Local);
    }

    /// Publish an event received from the remote side.
    ///
    /// Delivered to local handlers exactly like a local event, but never
    /// copied back to the bridge.
    pub fn publish_remote(&self, event: Event) {
        self.inner.submit(event, Origin::Remote);
    }

    // ------------------------------------------------------------------------
    // Kill switch
    // ------------------------------------------------------------------------

    pub fn set_muted(&self, muted: bool) {
        let was = self.inner.muted.swap(muted, Ordering::SeqCst);
        if was != muted {
            info!(muted, "event bus kill switch toggled");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------------

    /// Ensure exactly one dispatch worker is running. Safe to call repeatedly.
    ///
    /// Fails with [`BusError::QueueUnavailable`] while a `stop` is still
    /// waiting for the previous worker to hand the queue back.
    pub fn start(&self) -> Result<(), BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let mut worker = self.inner.lock_worker();

        if let Some(handle) = worker.handle.take() {
            if !handle.is_finished() {
                worker.handle = Some(handle);
                debug!("dispatch worker already running");
                return Ok(());
            }
            // A worker that ended without `stop` still owns the queue
            if let Some(Ok(queue)) = handle.now_or_never() {
                worker.queue = Some(queue);
            }
        }

        let Some(queue) = worker.queue.take() else {
            warn!("dispatch queue is not available, worker not started");
            return Err(BusError::QueueUnavailable);
        };

        let shutdown = CancellationToken::new();
        worker.shutdown = shutdown.clone();
        worker.handle = Some(runtime.spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            queue,
            shutdown,
        )));

        info!("dispatch worker started");
        Ok(())
    }

    /// Stop the dispatch worker after the event in flight.
    ///
    /// Queued events stay queued and are delivered after the next `start`.
    pub async fn stop(&self) {
        let handle = {
            let mut worker = self.inner.lock_worker();
            worker.shutdown.cancel();
            worker.handle.take()
        };

        let Some(handle) = handle else {
            return;
        };

        match handle.await {
            Ok(queue) => {
                self.inner.lock_worker().queue = Some(queue);
                info!("dispatch worker stopped");
            }
            Err(e) => error!(error = %e, "dispatch worker ended abnormally"),
        }
    }

    pub fn state(&self) -> BusState {
        let running = self
            .inner
            .lock_worker()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished());

        match (running, self.is_muted()) {
            (false, _) => BusState::Disabled,
            (true, true) => BusState::Muted,
            (true, false) => BusState::Running,
        }
    }

    // ------------------------------------------------------------------------
    // Bridge link
    // ------------------------------------------------------------------------

    /// Copy local events whose topic matches one of `patterns` to the returned channel.
    ///
    /// Replaces any previous link.
    pub fn attach_outbound(
        &self,
        patterns: impl IntoIterator<Item = TopicPattern>,
    ) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let patterns: Vec<TopicPattern> = patterns.into_iter().collect();
        info!(patterns = ?patterns.iter().map(ToString::to_string).collect::<Vec<_>>(), "outbound link attached");

        let previous = self
            .inner
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(OutboundLink { patterns, tx });
        if previous.is_some() {
            warn!("replaced an existing outbound link");
        }
        rx
    }

    pub fn detach_outbound(&self) {
        if self
            .inner
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("outbound link detached");
        }
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            emitted: c.emitted.load(Ordering::Relaxed),
            deliveries: c.deliveries.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn read_routes(&self) -> RwLockReadGuard<'_, Routes> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_routes(&self) -> RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, event: Event, origin: Origin) {
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);

        // Audit first: observability survives the kill switch
        self.audit.record_emit(&event);

        if self.muted.load(Ordering::SeqCst) {
            debug!(topic = %event.topic(), id = %event.id(), "bus muted, event not dispatched");
            return;
        }

        if origin == Origin::Local {
            self.forward_outbound(&event);
        }

        match self.queue_tx.try_send(Arc::new(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %event.topic(), id = %event.id(), "dispatch queue full, event dropped");
                self.audit.record_error(&event, "dispatch queue full");
            }
            Err(TrySendError::Closed(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(topic = %event.topic(), id = %event.id(), "dispatch queue closed, event dropped");
                self.audit.record_error(&event, "dispatch queue closed");
            }
        }
    }

    fn forward_outbound(&self, event: &Event) {
        let outbound = self.outbound.read().unwrap_or_else(PoisonError::into_inner);
        let Some(link) = outbound.as_ref() else {
            return;
        };
        if !link.patterns.iter().any(|p| p.matches(event.topic())) {
            return;
        }
        if link.tx.send(event.clone()).is_err() {
            debug!(topic = %event.topic(), "outbound link closed, event not bridged");
        }
    }

    async fn dispatch(&self, event: Arc<Event>) {
        let handlers = self.read_routes().resolve(event.topic());
        if handlers.is_empty() {
            debug!(topic = %event.topic(), "no handlers for event");
            return;
        }

        for (pattern, handler) in handlers {
            self.counters.deliveries.fetch_add(1, Ordering::Relaxed);

            let outcome = AssertUnwindSafe(handler.handle(event.clone()))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => HandlerFailure::Error {
                    pattern,
                    topic: event.topic().to_string(),
                    source,
                },
                Err(panic) => HandlerFailure::panic(pattern, event.topic().to_string(), panic),
            };

            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            error!(topic = %event.topic(), id = %event.id(), error = %failure, "event handler failed");
            self.audit.record_error(&event, &failure.to_string());
        }
    }
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    mut queue: DispatchQueue,
    shutdown: CancellationToken,
) -> DispatchQueue {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = queue.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(event).await;
    }
    queue
}
