//! Dispatch behaviour of the local bus:
//! - FIFO delivery and wildcard routing
//! - kill switch keeps the audit trail
//! - handler failures stay contained
//! - reply events carry causal links

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reflex_bus::{AuditLog, Bus, BusConfig, EventHandler};
use reflex_protocol::{Event, EventOptions, Topic};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const FLUSH_TOPIC: &str = "test.flush";

/// Audit sink shared with the test
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn lines_for(&self, topic: &str) -> Vec<Value> {
        self.lines()
            .into_iter()
            .filter(|l| l["topic"] == json!(topic))
            .collect()
    }
}

/// Bus with a captured audit log and a flush barrier
struct Harness {
    bus: Bus,
    audit: SharedBuffer,
    flushed: mpsc::UnboundedReceiver<()>,
}

impl Harness {
    fn new() -> Self {
        let audit = SharedBuffer::default();
        let bus = Bus::with_audit(BusConfig::default(), AuditLog::from_writer(audit.clone()));

        let (tx, flushed) = mpsc::unbounded_channel();
        bus.on(FLUSH_TOPIC, move |_| {
            tx.send(())?;
            Ok(())
        });

        Self { bus, audit, flushed }
    }

    /// Wait until every event emitted so far has been dispatched
    async fn flush(&mut self) {
        self.bus.emit(FLUSH_TOPIC, json!({})).unwrap();
        timeout(WAIT, self.flushed.recv())
            .await
            .expect("flush timed out")
            .expect("flush channel closed");
    }
}

fn recorder(bus: &Bus, pattern: &str) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.on(pattern, move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_fifo_delivery_per_topic() {
    let mut h = Harness::new();
    let mut exact = recorder(&h.bus, "guardian.contradiction");
    let mut wildcard = recorder(&h.bus, "guardian.*");
    h.bus.start().unwrap();

    let sent: Vec<String> = (1..=3)
        .map(|n| {
            h.bus
                .emit("guardian.contradiction", json!({ "n": n }))
                .unwrap()
                .id()
                .to_string()
        })
        .collect();
    h.flush().await;

    let exact_ids: Vec<String> = drain(&mut exact).iter().map(|e| e.id().to_string()).collect();
    let wildcard_ids: Vec<String> = drain(&mut wildcard).iter().map(|e| e.id().to_string()).collect();
    assert_eq!(exact_ids, sent);
    assert_eq!(wildcard_ids, sent);
}

#[tokio::test]
async fn test_wildcard_matching() {
    let mut h = Harness::new();
    let mut guardian = recorder(&h.bus, "guardian.*");
    h.bus.start().unwrap();

    h.bus.emit(Topic::GUARDIAN_CONTRADICTION, json!({})).unwrap();
    h.bus.emit(Topic::GUARDIAN_POLICY_UPDATE, json!({})).unwrap();
    h.bus.emit(Topic::MEDIATOR_RESOLUTION, json!({})).unwrap();
    h.flush().await;

    let topics: Vec<String> = drain(&mut guardian).iter().map(|e| e.topic().to_string()).collect();
    assert_eq!(topics, vec![Topic::GUARDIAN_CONTRADICTION, Topic::GUARDIAN_POLICY_UPDATE]);
}

#[tokio::test]
async fn test_mute_preserves_audit() {
    let mut h = Harness::new();
    let mut received = recorder(&h.bus, "guardian.contradiction");
    h.bus.start().unwrap();

    h.bus.set_muted(true);
    let muted = h.bus.emit("guardian.contradiction", json!({"phase": "muted"})).unwrap();
    assert_eq!(h.audit.lines_for("guardian.contradiction").len(), 1);

    h.bus.set_muted(false);
    let live = h.bus.emit("guardian.contradiction", json!({"phase": "live"})).unwrap();
    h.flush().await;

    let ids: Vec<String> = drain(&mut received).iter().map(|e| e.id().to_string()).collect();
    assert_eq!(ids, vec![live.id().to_string()]);
    assert!(!ids.contains(&muted.id().to_string()));

    let audited = h.audit.lines_for("guardian.contradiction");
    assert_eq!(audited.len(), 2);
    assert_eq!(audited[0]["id"], json!(muted.id()));
    assert_eq!(audited[0]["payload"]["phase"], json!("muted"));
}

#[tokio::test]
async fn test_kill_switch_from_config() {
    let audit = SharedBuffer::default();
    let bus = Bus::with_audit(
        BusConfig {
            muted: true,
            ..BusConfig::default()
        },
        AuditLog::from_writer(audit.clone()),
    );
    let mut received = recorder(&bus, "*");
    bus.start().unwrap();

    bus.emit("observations.health.disk", json!({"free_pct": 12})).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(received.try_recv().is_err());
    assert_eq!(audit.lines().len(), 1);
    assert_eq!(bus.stats().deliveries, 0);
}

#[tokio::test]
async fn test_handler_isolation() {
    let mut h = Harness::new();

    h.bus.on("x.topic", |_| anyhow::bail!("handler exploded"));
    let mut x = recorder(&h.bus, "x.topic");
    h.bus.on("x.*", |_| panic!("wildcard handler panicked"));
    let mut y = recorder(&h.bus, "y.topic");
    h.bus.start().unwrap();

    h.bus.emit("x.topic", json!({"n": 1})).unwrap();
    h.bus.emit("y.topic", json!({"n": 2})).unwrap();
    h.bus.emit("x.topic", json!({"n": 3})).unwrap();
    h.flush().await;

    assert_eq!(drain(&mut x).len(), 2);
    assert_eq!(drain(&mut y).len(), 1);
    assert_eq!(h.bus.stats().handler_failures, 4);

    let errors: Vec<String> = h
        .audit
        .lines_for("x.topic")
        .into_iter()
        .filter_map(|l| l["error"].as_str().map(str::to_string))
        .collect();
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().any(|e| e.contains("handler exploded")));
    assert!(errors.iter().any(|e| e.contains("wildcard handler panicked")));
}

struct SlowHandler {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.tx.send(event.topic().to_string())?;
        Ok(())
    }
}

#[tokio::test]
async fn test_emit_does_not_wait_for_handlers() {
    let mut h = Harness::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.bus.on_async("slow.*", SlowHandler { tx });
    h.bus.start().unwrap();

    let started = std::time::Instant::now();
    for n in 0..5 {
        h.bus.emit(&format!("slow.{n}"), json!({})).unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(20));

    h.flush().await;
    let mut topics = Vec::new();
    while let Ok(topic) = rx.try_recv() {
        topics.push(topic);
    }
    assert_eq!(topics, vec!["slow.0", "slow.1", "slow.2", "slow.3", "slow.4"]);
}

#[tokio::test]
async fn test_mediator_scenario() {
    let mut h = Harness::new();

    let (payload_tx, mut payloads) = mpsc::unbounded_channel();
    let mediator_bus = h.bus.clone();
    h.bus.on(Topic::GUARDIAN_CONTRADICTION, move |event| {
        payload_tx.send(event.payload().clone())?;
        mediator_bus.emit_as(
            "mediator",
            "reflex",
            Topic::MEDIATOR_RESOLUTION,
            json!({
                "conflict_id": event.id(),
                "summary": event.payload().get("summary").cloned().unwrap_or(Value::Null),
                "status": "follow-up",
            }),
            EventOptions::default()
                .parent(event.id())
                .tags(["mediator", "resolution"]),
        )?;
        Ok(())
    });
    let mut resolutions = recorder(&h.bus, Topic::MEDIATOR_RESOLUTION);
    h.bus.start().unwrap();

    let original = h
        .bus
        .emit(
            Topic::GUARDIAN_CONTRADICTION,
            json!({"summary": "mismatch", "severity": "high"}),
        )
        .unwrap();

    let resolution = timeout(WAIT, resolutions.recv()).await.unwrap().unwrap();
    h.flush().await;

    let payload = payloads.try_recv().unwrap();
    assert_eq!(
        Value::Object(payload),
        json!({"summary": "mismatch", "severity": "high"})
    );

    assert_eq!(resolution.parent_id(), Some(original.id()));
    assert_eq!(resolution.source(), "mediator");
    assert_eq!(resolution.payload()["conflict_id"], json!(original.id()));
    assert_eq!(resolution.tags(), ["mediator", "resolution"]);

    assert_eq!(h.audit.lines_for(Topic::GUARDIAN_CONTRADICTION).len(), 1);
    assert_eq!(h.audit.lines_for(Topic::MEDIATOR_RESOLUTION).len(), 1);
}
