//! Canonical event envelope.
//!
//! Every event that travels through the bus or crosses the bridge is an
//! [`Event`]. Construction goes through [`make_event`] and ingress from the
//! network goes through [`Event::from_value`]; both run [`validate_event`].

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Schema identifier stamped into `meta.schema`
pub const SCHEMA_ID: &str = "reflex.event";

/// Schema version stamped into `meta.version`
pub const SCHEMA_VERSION: &str = "1.0";

// ============================================================================
// Event
// ============================================================================

/// The unit of communication.
///
/// Fields are private: `id`, `topic` and `timestamp` never change once the
/// event exists, and `meta` is only touched by infrastructure through
/// [`Event::set_bridge_state`]. Top-level keys this version does not know
/// are kept in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: String,
    topic: String,
    #[serde(with = "millis_rfc3339")]
    timestamp: DateTime<Utc>,
    source: String,
    channel: String,
    payload: Map<String, Value>,
    #[serde(default)]
    meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causal: Option<Causal>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Causal links used to trace mediation and response threads
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Causal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CausalParent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalParent {
    pub id: String,
}

/// Delivery state recorded under `meta.bridge.state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Queued,
    Sent,
    Acknowledged,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Queued => "queued",
            BridgeState::Sent => "sent",
            BridgeState::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BridgeState::Queued),
            "sent" => Some(BridgeState::Sent),
            "acknowledged" => Some(BridgeState::Acknowledged),
            _ => None,
        }
    }
}

impl Event {
    /// Validate an untrusted JSON value and decode it into an event.
    ///
    /// This is the only way events from the remote side enter the process.
    pub fn from_value(value: Value) -> Result<Self, SchemaViolation> {
        validate_event(&value)?;
        serde_json::from_value(value).map_err(|e| SchemaViolation::Invalid {
            field: "event".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        // Serializing plain strings and maps cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or_default()
    }

    pub fn causal(&self) -> Option<&Causal> {
        self.causal.as_ref()
    }

    /// Unrecognised top-level keys carried through from the producer
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Id of the event this one responds to, if any
    pub fn parent_id(&self) -> Option<&str> {
        self.causal
            .as_ref()
            .and_then(|c| c.parent.as_ref())
            .map(|p| p.id.as_str())
    }

    pub fn bridge_state(&self) -> Option<BridgeState> {
        self.meta
            .get("bridge")
            .and_then(|b| b.get("state"))
            .and_then(Value::as_str)
            .and_then(BridgeState::parse)
    }

    /// Record the bridge delivery state, keeping any other `meta.bridge` keys.
    pub fn set_bridge_state(&mut self, state: BridgeState) {
        let bridge = self
            .meta
            .entry("bridge")
            .or_insert_with(|| Value::Object(Map::new()));
        if !bridge.is_object() {
            *bridge = Value::Object(Map::new());
        }
        if let Some(bridge) = bridge.as_object_mut() {
            bridge.insert("state".to_string(), Value::String(state.as_str().to_string()));
        }
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Optional inputs to [`make_event`]
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub parent_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub causal_chain: Option<Vec<String>>,
    pub meta: Option<Map<String, Value>>,
    /// Override for deterministic replay and tests
    pub id: Option<String>,
    /// Override for deterministic replay and tests
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventOptions {
    pub fn parent(mut self, id: impl Into<String>) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn chain<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.causal_chain = Some(chain.into_iter().map(Into::into).collect());
        self
    }

    pub fn meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Build a new event.
///
/// Assigns a fresh UUID and the current UTC time (millisecond precision)
/// unless overridden, stamps `meta` with the schema id and version, and
/// merges caller meta on top. The candidate is run through
/// [`validate_event`] before it is returned.
pub fn make_event(
    topic: impl Into<String>,
    payload: Value,
    source: impl Into<String>,
    channel: impl Into<String>,
    options: EventOptions,
) -> Result<Event, SchemaViolation> {
    let mut meta = Map::new();
    meta.insert("schema".to_string(), json!(SCHEMA_ID));
    meta.insert("version".to_string(), json!(SCHEMA_VERSION));
    if let Some(extra) = options.meta {
        meta.extend(extra);
    }

    let timestamp = options.timestamp.unwrap_or_else(Utc::now).trunc_subsecs(3);

    let mut candidate = json!({
        "id": options.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        "topic": topic.into(),
        "timestamp": format_timestamp(&timestamp),
        "source": source.into(),
        "channel": channel.into(),
        "payload": payload,
        "meta": Value::Object(meta),
    });

    if let Some(tags) = options.tags {
        candidate["tags"] = json!(tags);
    }

    let mut causal = Map::new();
    if let Some(parent) = options.parent_id {
        causal.insert("parent".to_string(), json!({ "id": parent }));
    }
    if let Some(chain) = options.causal_chain {
        causal.insert("chain".to_string(), json!(chain));
    }
    if !causal.is_empty() {
        candidate["causal"] = Value::Object(causal);
    }

    Event::from_value(candidate)
}

// ============================================================================
// Validation
// ============================================================================

/// Structural validation failure, naming the offending field
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("missing required field `{0}`")]
    Missing(String),
    #[error("field `{field}` must be {expected}")]
    WrongType { field: String, expected: &'static str },
    #[error("field `{field}` is invalid: {reason}")]
    Invalid { field: String, reason: String },
}

impl SchemaViolation {
    pub fn field(&self) -> &str {
        match self {
            SchemaViolation::Missing(field) => field,
            SchemaViolation::WrongType { field, .. } => field,
            SchemaViolation::Invalid { field, .. } => field,
        }
    }

    fn wrong_type(field: &str, expected: &'static str) -> Self {
        SchemaViolation::WrongType {
            field: field.to_string(),
            expected,
        }
    }
}

/// Check a candidate against the fixed envelope contract.
///
/// Payload contents are producer-defined and only checked for being an
/// object.
pub fn validate_event(candidate: &Value) -> Result<(), SchemaViolation> {
    let object = candidate
        .as_object()
        .ok_or_else(|| SchemaViolation::wrong_type("event", "an object"))?;

    let id = required_str(object, "id")?;
    if id.trim().is_empty() {
        return Err(SchemaViolation::Invalid {
            field: "id".to_string(),
            reason: "must not be empty".to_string(),
        });
    }

    let topic = required_str(object, "topic")?;
    if topic.trim().is_empty() {
        return Err(SchemaViolation::Invalid {
            field: "topic".to_string(),
            reason: "must not be empty".to_string(),
        });
    }

    let timestamp = required_str(object, "timestamp")?;
    parse_timestamp(timestamp).map_err(|e| SchemaViolation::Invalid {
        field: "timestamp".to_string(),
        reason: e.to_string(),
    })?;

    required_str(object, "source")?;
    required_str(object, "channel")?;

    match object.get("payload") {
        None => return Err(SchemaViolation::Missing("payload".to_string())),
        Some(Value::Object(_)) => {}
        Some(_) => return Err(SchemaViolation::wrong_type("payload", "an object")),
    }

    if let Some(meta) = object.get("meta") {
        if !meta.is_object() {
            return Err(SchemaViolation::wrong_type("meta", "an object"));
        }
    }

    if let Some(tags) = object.get("tags") {
        string_array(tags, "tags")?;
    }

    if let Some(causal) = object.get("causal") {
        let causal = causal
            .as_object()
            .ok_or_else(|| SchemaViolation::wrong_type("causal", "an object"))?;
        if let Some(parent) = causal.get("parent") {
            let parent = parent
                .as_object()
                .ok_or_else(|| SchemaViolation::wrong_type("causal.parent", "an object"))?;
            match parent.get("id") {
                None => return Err(SchemaViolation::Missing("causal.parent.id".to_string())),
                Some(Value::String(_)) => {}
                Some(_) => return Err(SchemaViolation::wrong_type("causal.parent.id", "a string")),
            }
        }
        if let Some(chain) = causal.get("chain") {
            string_array(chain, "causal.chain")?;
        }
    }

    Ok(())
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, SchemaViolation> {
    match object.get(field) {
        None => Err(SchemaViolation::Missing(field.to_string())),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(SchemaViolation::wrong_type(field, "a string")),
    }
}

fn string_array(value: &Value, field: &str) -> Result<(), SchemaViolation> {
    let items = value
        .as_array()
        .ok_or_else(|| SchemaViolation::wrong_type(field, "an array of strings"))?;
    if items.iter().all(Value::is_string) {
        Ok(())
    } else {
        Err(SchemaViolation::wrong_type(field, "an array of strings"))
    }
}

// ============================================================================
// Timestamps
// ============================================================================

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

/// RFC 3339, UTC, millisecond precision
mod millis_rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================
