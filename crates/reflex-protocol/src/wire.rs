//! Bridge wire protocol.
//!
//! One JSON object per WebSocket text frame, tagged by `type`:
//!
//! ```json
//! {"type": "identify", "role": "reflex-bridge"}
//! {"type": "event", "data": {...}}
//! {"type": "ack", "id": "..."}
//! {"type": "hydrate", "events": [{...}, ...]}
//! ```
//!
//! Event bodies stay as raw JSON here; they are validated with
//! [`Event::from_value`](crate::Event::from_value) one at a time so a bad
//! entry never poisons the rest of a batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Event;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Sent once when a session opens
    Identify { role: String },
    /// One event, in either direction
    Event { data: Value },
    /// Remote confirmation that event `id` was durably received
    Ack { id: String },
    /// Bulk catch-up from the remote side
    Hydrate {
        #[serde(default)]
        events: Vec<Value>,
    },
    /// Any message kind this version does not know about
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn identify(role: impl Into<String>) -> Self {
        WireMessage::Identify { role: role.into() }
    }

    pub fn event(event: &Event) -> Self {
        WireMessage::Event {
            data: event.to_value(),
        }
    }

    pub fn ack(id: impl Into<String>) -> Self {
        WireMessage::Ack { id: id.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Identify { .. } => "identify",
            WireMessage::Event { .. } => "event",
            WireMessage::Ack { .. } => "ack",
            WireMessage::Hydrate { .. } => "hydrate",
            WireMessage::Unknown => "unknown",
        }
    }
}
