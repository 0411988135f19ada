//! WebSocket session between the local bus and the remote event service.
//!
//! Bus events matching the configured prefixes flow through three stages:
//!
//! ```text
//! bus outbound link -> intake (offline queue) -> session channel -> forwarder -> WebSocket
//! ```
//!
//! The intake task persists every event before it is handed to a session,
//! so a crash or disconnect never loses an unacknowledged event. Each new
//! session replays the whole offline queue before sending live events, and
//! entries leave the queue only when the remote side acks them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use reflex_bus::Bus;
use reflex_protocol::{BridgeState, Event, WireMessage};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{BridgeSettings, ConfigError};
use crate::offline_queue::{OfflineQueue, PersistenceError, QueueEntry};
use crate::pending::PendingTable;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Outbound = mpsc::UnboundedReceiver<Event>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("failed to encode wire message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bridge task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Counters since the bridge was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Events written to the socket, replays included
    pub sent: u64,
    /// Events sent while replaying the offline queue
    pub replayed: u64,
    pub acked: u64,
    pub reconnects: u64,
    /// Inbound events delivered to the local bus
    pub inbound_applied: u64,
    /// Inbound events dropped for failing validation
    pub inbound_rejected: u64,
    /// Inbound frames that were not valid wire messages
    pub malformed: u64,
    pub persistence_failures: u64,
    pub last_ack_latency_ms: Option<u64>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    replayed: AtomicU64,
    acked: AtomicU64,
    reconnects: AtomicU64,
    inbound_applied: AtomicU64,
    inbound_rejected: AtomicU64,
    malformed: AtomicU64,
    persistence_failures: AtomicU64,
    last_ack_latency_ms: std::sync::Mutex<Option<u64>>,
}

enum ConnectionResult {
    /// Connection lost, try again after the delay with the session channel
    Reconnect(Outbound),
    Shutdown,
    Fatal(BridgeError),
}

enum Disconnect {
    Shutdown,
    Lost(&'static str),
}

struct Shared {
    settings: BridgeSettings,
    endpoint: Url,
    bus: Bus,
    /// Mutations rewrite and fsync the file, so they run on the blocking pool
    queue: Arc<Mutex<OfflineQueue>>,
    pending: PendingTable,
    counters: Counters,
    shutdown: CancellationToken,
}

pub struct Bridge {
    shared: Arc<Shared>,
    outbound: Outbound,
}

/// Control and inspection handle, usable while [`Bridge::run`] is in progress
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl Bridge {
    /// Open the offline queue and attach to the bus's outbound link.
    ///
    /// Events emitted after this call are captured even before `run` starts.
    pub fn new(settings: BridgeSettings, bus: Bus) -> Result<Self, BridgeError> {
        let endpoint = settings.endpoint()?;
        let queue = OfflineQueue::open(&settings.queue_path)?;
        info!(path = %queue.path().display(), pending = queue.len(), "offline queue opened");
        let outbound = bus.attach_outbound(settings.topic_patterns());

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                endpoint,
                bus,
                queue: Arc::new(Mutex::new(queue)),
                pending: PendingTable::new(),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
            }),
            outbound,
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Keep a session open until [`BridgeHandle::shutdown`] is called.
    ///
    /// Connection failures are retried forever; only an unrecoverable
    /// internal error ends the loop with `Err`.
    pub async fn run(self) -> Result<(), BridgeError> {
        let Bridge { shared, outbound } = self;

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let intake = tokio::spawn(intake_loop(shared.clone(), outbound, session_tx));

        let result = shared.run_sessions(session_rx).await;

        // Detaching closes the link; intake persists whatever is left and exits
        shared.shutdown.cancel();
        shared.bus.detach_outbound();
        if let Err(e) = intake.await {
            error!(error = %e, "intake task ended abnormally");
        }

        let pending = shared.queue.lock().await.len();
        info!(pending, "bridge stopped");
        result
    }
}

impl BridgeHandle {
    /// Close the session and make `run` return
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!("bridge shutdown requested");
            self.shared.shutdown.cancel();
        }
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.shared.counters;
        BridgeStats {
            sent: c.sent.load(Ordering::Relaxed),
            replayed: c.replayed.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            inbound_applied: c.inbound_applied.load(Ordering::Relaxed),
            inbound_rejected: c.inbound_rejected.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            last_ack_latency_ms: *c
                .last_ack_latency_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Snapshot of events not yet acknowledged, oldest first
    pub async fn pending_events(&self) -> Vec<QueueEntry> {
        self.shared.queue.lock().await.iter().cloned().collect()
    }
}

// ============================================================================
// Intake
// ============================================================================

async fn intake_loop(
    shared: Arc<Shared>,
    mut outbound: Outbound,
    session_tx: mpsc::UnboundedSender<Event>,
) {
    while let Some(mut event) = outbound.recv().await {
        event.set_bridge_state(BridgeState::Queued);

        let queued = event.clone();
        shared.mutate_queue(move |queue| queue.append(queued)).await;

        debug!(id = %event.id(), topic = %event.topic(), "event queued for bridge");
        if session_tx.send(event).is_err() {
            debug!("session channel closed, event stays in offline queue");
        }
    }
    debug!("outbound link closed, intake stopped");
}

// ============================================================================
// Sessions
// ============================================================================

impl Shared {
    async fn run_sessions(self: &Arc<Self>, session_rx: Outbound) -> Result<(), BridgeError> {
        let mut outbound = session_rx;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.run_session(outbound).await {
                ConnectionResult::Reconnect(returned) => {
                    outbound = returned;
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);

                    let delay = self.settings.reconnect_delay();
                    info!(delay_ms = delay.as_millis() as u64, "connection lost, reconnecting...");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ConnectionResult::Shutdown => return Ok(()),
                ConnectionResult::Fatal(e) => {
                    error!(error = %e, "fatal error, stopping bridge");
                    return Err(e);
                }
            }
        }
    }

    async fn run_session(self: &Arc<Self>, mut outbound: Outbound) -> ConnectionResult {
        info!(url = %self.endpoint, role = %self.settings.role, "connecting to event service");

        let connect = tokio::select! {
            _ = self.shutdown.cancelled() => return ConnectionResult::Shutdown,
            result = tokio::time::timeout(self.settings.io_timeout(), connect_async(self.endpoint.as_str())) => result,
        };
        let ws_stream = match connect {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to event service");
                return ConnectionResult::Reconnect(outbound);
            }
            Err(_) => {
                warn!(timeout_ms = self.settings.io_timeout_ms, "connect timed out");
                return ConnectionResult::Reconnect(outbound);
            }
        };
        info!("connected to event service");

        let (mut ws_write, mut ws_read) = ws_stream.split();

        match self
            .send_wire(&mut ws_write, &WireMessage::identify(self.settings.role.clone()))
            .await
        {
            Ok(()) => {}
            Err(BridgeError::Encode(e)) => return ConnectionResult::Fatal(e.into()),
            Err(e) => {
                warn!(error = %e, "failed to send identify");
                return ConnectionResult::Reconnect(outbound);
            }
        }

        // Everything in the channel is already in the offline queue
        let mut covered = 0usize;
        while outbound.try_recv().is_ok() {
            covered += 1;
        }
        if covered > 0 {
            debug!(count = covered, "discarded buffered events covered by replay");
        }

        self.pending.clear().await;
        match self.replay(&mut ws_write).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = tokio::time::timeout(self.settings.io_timeout(), ws_write.close()).await;
                return ConnectionResult::Shutdown;
            }
            Err(e) => {
                warn!(error = %e, "replay failed");
                return ConnectionResult::Reconnect(outbound);
            }
        }

        let session = self.shutdown.child_token();
        let mut forwarder = tokio::spawn(forward_loop(
            self.clone(),
            ws_write,
            outbound,
            session.clone(),
        ));

        let disconnect = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Disconnect::Shutdown,
                joined = &mut forwarder => {
                    // The forwarder only stops on its own after a failed write
                    return match joined {
                        Ok(returned) => ConnectionResult::Reconnect(returned),
                        Err(e) => ConnectionResult::Fatal(e.into()),
                    };
                }
                message = ws_read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(&text).await,
                    Some(Ok(Message::Close(_))) => break Disconnect::Lost("remote closed"),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error, will reconnect");
                        break Disconnect::Lost("websocket error");
                    }
                    None => break Disconnect::Lost("stream ended"),
                },
            }
        };

        session.cancel();
        let returned = match forwarder.await {
            Ok(returned) => returned,
            Err(e) => return ConnectionResult::Fatal(e.into()),
        };

        match disconnect {
            Disconnect::Shutdown => {
                info!("session closed for shutdown");
                ConnectionResult::Shutdown
            }
            Disconnect::Lost(reason) => {
                let unacked = self.pending.len().await;
                info!(reason, unacked, "disconnected from event service");
                ConnectionResult::Reconnect(returned)
            }
        }
    }

    /// Send every offline queue entry in order. Returns `false` if shutdown interrupted it.
    async fn replay(&self, sink: &mut WsSink) -> Result<bool, BridgeError> {
        let backlog: Vec<Event> = self
            .queue
            .lock()
            .await
            .iter()
            .map(|entry| entry.event.clone())
            .collect();

        if backlog.is_empty() {
            return Ok(true);
        }
        info!(count = backlog.len(), "replaying offline queue");

        for event in backlog {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }
            self.send_event(sink, event, true).await?;
        }
        Ok(true)
    }

    async fn send_event(
        &self,
        sink: &mut WsSink,
        mut event: Event,
        replay: bool,
    ) -> Result<(), BridgeError> {
        event.set_bridge_state(BridgeState::Sent);
        let id = event.id().to_string();
        self.mutate_queue(move |queue| queue.mark_sent(&id)).await;

        // Tracked before the write so a fast ack still finds it
        self.pending.track(event.id()).await;
        self.send_wire(sink, &WireMessage::event(&event)).await?;

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        if replay {
            self.counters.replayed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(id = %event.id(), topic = %event.topic(), replay, "event sent");
        Ok(())
    }

    async fn send_wire(&self, sink: &mut WsSink, message: &WireMessage) -> Result<(), BridgeError> {
        let text = serde_json::to_string(message)?;
        tokio::time::timeout(self.settings.io_timeout(), sink.send(Message::Text(text)))
            .await
            .map_err(|_| BridgeError::Timeout("send"))??;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn handle_inbound(&self, text: &str) {
        let message: WireMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "malformed message from event service");
                return;
            }
        };

        debug!(kind = message.kind(), "message from event service");
        match message {
            WireMessage::Ack { id } => self.handle_ack(&id).await,
            WireMessage::Event { data } => self.apply_inbound(data),
            WireMessage::Hydrate { events } => {
                info!(count = events.len(), "hydrating from event service");
                for data in events {
                    self.apply_inbound(data);
                }
            }
            WireMessage::Identify { role } => debug!(role = %role, "remote identified"),
            WireMessage::Unknown => debug!("ignoring unknown message type"),
        }
    }

    async fn handle_ack(&self, id: &str) {
        let latency = self.pending.complete(id).await;
        let latency_ms = latency.map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX));
        if latency_ms.is_some() {
            *self
                .counters
                .last_ack_latency_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = latency_ms;
        }

        let acked = id.to_string();
        match self.mutate_queue(move |queue| queue.ack(&acked)).await {
            Some(Some(_)) => {
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
                info!(id, latency_ms = ?latency_ms, "event acknowledged");
            }
            Some(None) => debug!(id, "ack for an event not in the offline queue"),
            None => {}
        }
    }

    fn apply_inbound(&self, data: Value) {
        match Event::from_value(data) {
            Ok(event) => {
                self.counters.inbound_applied.fetch_add(1, Ordering::Relaxed);
                debug!(id = %event.id(), topic = %event.topic(), "inbound event");
                self.bus.publish_remote(event);
            }
            Err(violation) => {
                self.counters.inbound_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(field = violation.field(), error = %violation, "rejected inbound event");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Offline queue
    // ------------------------------------------------------------------------

    /// Run a queue mutation on the blocking pool.
    ///
    /// Returns `None` when the write failed; the failure is already counted
    /// and logged, and the in-memory entries keep the change.
    async fn mutate_queue<T, F>(&self, op: F) -> Option<T>
    where
        F: FnOnce(&mut OfflineQueue) -> Result<T, PersistenceError> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.queue.clone();
        match tokio::task::spawn_blocking(move || op(&mut *queue.blocking_lock())).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.persistence_failed(&e);
                None
            }
            Err(e) => {
                self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "offline queue task failed");
                None
            }
        }
    }

    fn persistence_failed(&self, e: &PersistenceError) {
        self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
        error!(error = %e, "offline queue write failed");
    }

    /// A live event goes out only if this session has not sent it yet and
    /// it is still waiting in the offline queue.
    ///
    /// Replay can send and get an ack for an event before its buffered live
    /// copy reaches the forwarder; that copy must not be sent again.
    async fn should_forward(&self, id: &str) -> bool {
        if self.pending.contains(id).await {
            debug!(id, "already sent in this session");
            return false;
        }
        if !self.queue.lock().await.contains(id) {
            debug!(id, "already acknowledged");
            return false;
        }
        true
    }
}

// ============================================================================
// Forwarder
// ============================================================================

/// Live events and keep-alive pings -> WebSocket. Hands the channel back when done.
async fn forward_loop(
    shared: Arc<Shared>,
    mut sink: WsSink,
    mut outbound: Outbound,
    session: CancellationToken,
) -> Outbound {
    let mut ping = shared.settings.ping_interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut intake_open = true;

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            event = outbound.recv(), if intake_open => match event {
                Some(event) => {
                    if !shared.should_forward(event.id()).await {
                        continue;
                    }
                    if let Err(e) = shared.send_event(&mut sink, event, false).await {
                        warn!(error = %e, "websocket send failed, stopping forwarder");
                        return outbound;
                    }
                }
                None => {
                    debug!("session channel closed");
                    intake_open = false;
                }
            },
            _ = next_ping(&mut ping) => {
                let sent = tokio::time::timeout(
                    shared.settings.io_timeout(),
                    sink.send(Message::Ping(Vec::new())),
                )
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    warn!("keep-alive ping failed, stopping forwarder");
                    return outbound;
                }
            }
        }
    }

    if let Ok(Err(e)) = tokio::time::timeout(shared.settings.io_timeout(), sink.close()).await {
        debug!(error = %e, "close frame not sent");
    }
    outbound
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflex_bus::{AuditLog, BusConfig};
    use reflex_protocol::{EventOptions, make_event};
    use serde_json::json;
    use std::time::Duration;

    fn bridge(dir: &tempfile::TempDir) -> (Bridge, Bus) {
        let bus = Bus::with_audit(BusConfig::default(), AuditLog::from_writer(std::io::sink()));
        let settings = BridgeSettings {
            url: Some("ws://127.0.0.1:9".to_string()),
            queue_path: dir.path().join("queue.jsonl"),
            ..BridgeSettings::default()
        };
        (Bridge::new(settings, bus.clone()).unwrap(), bus)
    }

    fn wire_event(id: &str, topic: &str) -> Value {
        make_event(topic, json!({}), "remote", "reflex", EventOptions::default().id(id))
            .unwrap()
            .to_value()
    }

    #[tokio::test]
    async fn test_new_rejects_bad_url() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::with_audit(BusConfig::default(), AuditLog::from_writer(std::io::sink()));
        let settings = BridgeSettings {
            url: Some("http://127.0.0.1:9".to_string()),
            queue_path: dir.path().join("queue.jsonl"),
            ..BridgeSettings::default()
        };
        let err = Bridge::new(settings, bus).err().unwrap();
        assert!(matches!(err, BridgeError::Config(ConfigError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn test_inbound_messages_update_counters() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, bus) = bridge(&dir);
        let handle = bridge.handle();
        let shared = bridge.shared.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.on("memory.*", move |event: &Event| {
            tx.send(event.id().to_string())?;
            Ok(())
        });
        bus.start().unwrap();

        shared.handle_inbound("not json").await;
        shared.handle_inbound(r#"{"type": "shrug"}"#).await;
        shared
            .handle_inbound(
                &json!({"type": "event", "data": wire_event("in-1", "memory.state.snapshot")}).to_string(),
            )
            .await;
        shared
            .handle_inbound(
                &json!({
                    "type": "hydrate",
                    "events": [
                        wire_event("in-2", "memory.state.snapshot"),
                        {"id": "broken"},
                        wire_event("in-3", "memory.state.snapshot"),
                    ]
                })
                .to_string(),
            )
            .await;

        let mut received = Vec::new();
        for _ in 0..3 {
            let id = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(id);
        }
        assert_eq!(received, vec!["in-1", "in-2", "in-3"]);

        let stats = handle.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.inbound_applied, 3);
        assert_eq!(stats.inbound_rejected, 1);
    }

    #[tokio::test]
    async fn test_ack_removes_queue_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _bus) = bridge(&dir);
        let handle = bridge.handle();
        let shared = bridge.shared.clone();

        shared.queue.lock().await.append(outgoing("out-1")).unwrap();
        shared.pending.track("out-1").await;

        shared.handle_inbound(r#"{"type": "ack", "id": "out-1"}"#).await;
        shared.handle_inbound(r#"{"type": "ack", "id": "out-1"}"#).await;

        let stats = handle.stats();
        assert_eq!(stats.acked, 1);
        assert!(stats.last_ack_latency_ms.is_some());
        assert!(handle.pending_events().await.is_empty());
    }

    fn outgoing(id: &str) -> Event {
        make_event(
            "guardian.contradiction",
            json!({}),
            "guardian",
            "reflex",
            EventOptions::default().id(id),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_live_copy_of_sent_or_acked_event_is_not_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _bus) = bridge(&dir);
        let shared = bridge.shared.clone();

        for id in ["replayed", "acked", "fresh"] {
            shared.queue.lock().await.append(outgoing(id)).unwrap();
        }
        shared.pending.track("replayed").await;
        shared.pending.track("acked").await;
        shared.handle_inbound(r#"{"type": "ack", "id": "acked"}"#).await;

        assert!(!shared.should_forward("replayed").await);
        assert!(!shared.should_forward("acked").await);
        assert!(shared.should_forward("fresh").await);
        assert!(!shared.should_forward("never-queued").await);
    }

    #[tokio::test]
    async fn test_queue_write_failure_is_counted_and_entry_kept() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _bus) = bridge(&dir);
        let handle = bridge.handle();
        let shared = bridge.shared.clone();

        std::fs::create_dir(dir.path().join("queue.jsonl.tmp")).unwrap();

        let written = shared
            .mutate_queue(|queue| queue.append(outgoing("out-1")))
            .await;
        assert!(written.is_none());
        assert_eq!(handle.stats().persistence_failures, 1);

        let pending = handle.pending_events().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), "out-1");
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, bus) = bridge(&dir);
        let handle = bridge.handle();

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), bridge.run())
            .await
            .unwrap()
            .unwrap();

        // Link is gone: nothing reaches the queue any more
        bus.emit("guardian.contradiction", json!({})).unwrap();
        assert!(handle.pending_events().await.is_empty());
    }
}
