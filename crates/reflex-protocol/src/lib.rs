//! Shared protocol definitions for the reflex bus and its bridge.
//!
//! - [`envelope`]: the canonical [`Event`] structure, its constructor and
//!   structural validator.
//! - [`topics`]: well-known topics and topic pattern matching.
//! - [`wire`]: JSON messages exchanged with the remote event service.

pub mod envelope;
pub mod topics;
pub mod wire;

pub use envelope::{
    BridgeState, Causal, CausalParent, Event, EventOptions, SchemaViolation, make_event,
    validate_event,
};
pub use topics::{BRIDGED_PREFIXES, Topic, TopicPattern};
pub use wire::WireMessage;
