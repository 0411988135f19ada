//! Append-only audit log.
//!
//! One JSON object per line. Emits are recorded even while the bus is
//! muted; handler failures and dropped events are recorded as error lines.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use reflex_protocol::Event;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Serialize)]
struct EmitRecord<'a> {
    timestamp: String,
    topic: &'a str,
    id: &'a str,
    payload: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct ErrorRecord<'a> {
    timestamp: String,
    topic: &'a str,
    id: &'a str,
    error: &'a str,
}

/// Single-writer audit sink
pub struct AuditLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl AuditLog {
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    /// Open (or create) `path` in append mode
    pub fn file(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(writer)),
        }
    }

    pub fn record_emit(&self, event: &Event) {
        let record = EmitRecord {
            timestamp: now(),
            topic: event.topic(),
            id: event.id(),
            payload: event.payload(),
        };
        self.write(&record);
    }

    pub fn record_error(&self, event: &Event, error: &str) {
        let record = ErrorRecord {
            timestamp: now(),
            topic: event.topic(),
            id: event.id(),
            error,
        };
        self.write(&record);
    }

    fn write<T: Serialize>(&self, record: &T) {
        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode audit record");
                return;
            }
        };
        line.push('\n');

        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = sink.write_all(line.as_bytes()).and_then(|_| sink.flush()) {
            tracing::warn!(error = %e, "failed to write audit record");
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
