use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Events sent in the current session and still waiting for an ack
///
/// Used to pair acks with sends:
/// 1. The session sends an event and calls `track()`
/// 2. The reader receives `{"type": "ack", "id": ...}`
/// 3. `complete()` removes the entry and reports how long the ack took
///
/// Live events already tracked (because replay sent them) are skipped by
/// the forwarder, so each id goes out at most once per session.
#[derive(Clone, Default)]
pub struct PendingTable {
    pending: Arc<Mutex<HashMap<String, Instant>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, id: impl Into<String>) {
        self.pending.lock().await.insert(id.into(), Instant::now());
    }

    /// Remove an acknowledged id, returning the time since it was sent.
    ///
    /// Unknown ids (already acked, or sent in an earlier session) yield `None`.
    pub async fn complete(&self, id: &str) -> Option<Duration> {
        self.pending
            .lock()
            .await
            .remove(id)
            .map(|sent_at| sent_at.elapsed())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Forget everything; called when a new session starts
    pub async fn clear(&self) {
        self.pending.lock().await.clear();
    }
}
