//! In-process publish/subscribe for reflex events.
//!
//! Producers call [`Bus::emit`] or [`Bus::publish`] and return immediately.
//! A single background worker delivers events to handlers registered with
//! [`Bus::on`], in the order they were emitted. Handler failures are
//! contained and recorded in the [`AuditLog`]; they never reach the producer.

pub mod audit;
pub mod bus;
pub mod config;
pub mod handler;

pub use audit::AuditLog;
pub use bus::{Bus, BusError, BusState, BusStats};
pub use config::BusConfig;
pub use handler::{EventHandler, HandlerFailure};
