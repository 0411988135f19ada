//! Durable store of events not yet acknowledged by the remote side.
//!
//! JSON lines, one [`QueueEntry`] per line, in insertion order. Every
//! mutation rewrites the whole pending set to a temporary file and renames
//! it over the queue file, so a crash leaves either the old or the new set.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use reflex_protocol::{BridgeState, Event};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub state: BridgeState,
    pub event: Event,
}

impl QueueEntry {
    pub fn id(&self) -> &str {
        self.event.id()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("offline queue {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("offline queue {path}: failed to encode entry: {source}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub struct OfflineQueue {
    path: PathBuf,
    entries: Vec<QueueEntry>,
}

impl OfflineQueue {
    /// Open the queue at `path`, loading whatever a previous run left behind
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let entries = match fs::read_to_string(&path) {
            Ok(content) => parse_entries(&path, &content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };

        if !entries.is_empty() {
            tracing::info!(path = %path.display(), pending = entries.len(), "loaded offline queue");
        }

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add an event as `queued` and persist.
    ///
    /// On a write failure the entry stays in memory and the error is returned.
    pub fn append(&mut self, mut event: Event) -> Result<(), PersistenceError> {
        event.set_bridge_state(BridgeState::Queued);
        self.entries.push(QueueEntry {
            state: BridgeState::Queued,
            event,
        });
        self.persist()
    }

    /// Mark an entry as sent. Returns whether the id was pending.
    pub fn mark_sent(&mut self, id: &str) -> Result<bool, PersistenceError> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id() == id) else {
            return Ok(false);
        };
        if entry.state == BridgeState::Sent {
            return Ok(true);
        }
        entry.state = BridgeState::Sent;
        entry.event.set_bridge_state(BridgeState::Sent);
        self.persist()?;
        Ok(true)
    }

    /// Drop an acknowledged entry. Unknown ids are a no-op.
    pub fn ack(&mut self, id: &str) -> Result<Option<QueueEntry>, PersistenceError> {
        let Some(index) = self.entries.iter().position(|e| e.id() == id) else {
            return Ok(None);
        };
        let mut entry = self.entries.remove(index);
        entry.state = BridgeState::Acknowledged;
        entry.event.set_bridge_state(BridgeState::Acknowledged);
        self.persist()?;
        Ok(Some(entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<(), PersistenceError> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            serde_json::to_writer(&mut buf, entry).map_err(|source| PersistenceError::Encode {
                path: self.path.clone(),
                source,
            })?;
            buf.push(b'\n');
        }

        let tmp = temp_path(&self.path);
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// `<path>.tmp`, next to the queue file and never equal to it
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn parse_entries(path: &Path, content: &str) -> Vec<QueueEntry> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| match serde_json::from_str::<QueueEntry>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = n + 1, error = %e, "skipping corrupt offline queue line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflex_protocol::{EventOptions, make_event};
    use serde_json::json;

    fn event(name: &str) -> Event {
        make_event(
            "guardian.contradiction",
            json!({ "name": name }),
            "guardian",
            "guardian",
            EventOptions::default().id(name),
        )
        .unwrap()
    }

    fn ids(queue: &OfflineQueue) -> Vec<String> {
        queue.iter().map(|e| e.id().to_string()).collect()
    }

    #[test]
    fn test_replay_order_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");

        {
            let mut queue = OfflineQueue::open(&path).unwrap();
            for name in ["a", "b", "c"] {
                queue.append(event(name)).unwrap();
            }
        }

        let mut queue = OfflineQueue::open(&path).unwrap();
        assert_eq!(ids(&queue), vec!["a", "b", "c"]);

        let acked = queue.ack("b").unwrap().unwrap();
        assert_eq!(acked.state, BridgeState::Acknowledged);
        drop(queue);

        let queue = OfflineQueue::open(&path).unwrap();
        assert_eq!(ids(&queue), vec!["a", "c"]);
    }

    #[test]
    fn test_ack_unknown_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let mut queue = OfflineQueue::open(&path).unwrap();
        queue.append(event("a")).unwrap();

        assert!(queue.ack("missing").unwrap().is_none());
        assert!(queue.ack("a").unwrap().is_some());
        assert!(queue.ack("a").unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_state_transitions_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.jsonl");

        let mut queue = OfflineQueue::open(&path).unwrap();
        queue.append(event("a")).unwrap();
        queue.append(event("b")).unwrap();
        assert!(queue.mark_sent("a").unwrap());
        assert!(!queue.mark_sent("zzz").unwrap());
        drop(queue);

        let queue = OfflineQueue::open(&path).unwrap();
        let states: Vec<BridgeState> = queue.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![BridgeState::Sent, BridgeState::Queued]);

        let first = queue.iter().next().unwrap();
        assert_eq!(first.event.bridge_state(), Some(BridgeState::Sent));
        assert!(queue.contains("b"));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");

        {
            let mut queue = OfflineQueue::open(&path).unwrap();
            queue.append(event("a")).unwrap();
        }
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n\n");
        fs::write(&path, content).unwrap();

        let queue = OfflineQueue::open(&path).unwrap();
        assert_eq!(ids(&queue), vec!["a"]);
    }

    #[test]
    fn test_failed_write_keeps_entry_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let mut queue = OfflineQueue::open(&path).unwrap();

        // A directory where the temp file should go makes the rewrite fail
        fs::create_dir(dir.path().join("queue.jsonl.tmp")).unwrap();

        let err = queue.append(event("a")).unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
        assert_eq!(ids(&queue), vec!["a"]);
    }

    #[test]
    fn test_temp_file_is_named_after_full_queue_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        assert_eq!(temp_path(&path), dir.path().join("queue.jsonl.tmp"));

        // An unrelated file that only differs by extension is left alone
        let neighbour = dir.path().join("queue.tmp");
        fs::write(&neighbour, "keep").unwrap();

        let mut queue = OfflineQueue::open(&path).unwrap();
        queue.append(event("a")).unwrap();

        assert_eq!(fs::read_to_string(&neighbour).unwrap(), "keep");
        assert_eq!(ids(&OfflineQueue::open(&path).unwrap()), vec!["a"]);
    }

    #[test]
    fn test_queue_file_with_tmp_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.tmp");
        assert_eq!(temp_path(&path), dir.path().join("queue.tmp.tmp"));

        let mut queue = OfflineQueue::open(&path).unwrap();
        queue.append(event("a")).unwrap();
        queue.append(event("b")).unwrap();
        queue.ack("a").unwrap();
        assert_eq!(queue.path(), path.as_path());
        drop(queue);

        assert!(!dir.path().join("queue.tmp.tmp").exists());
        assert_eq!(ids(&OfflineQueue::open(&path).unwrap()), vec!["b"]);
    }
}
