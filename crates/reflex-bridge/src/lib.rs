pub mod bridge;
pub mod config;
pub mod offline_queue;
pub mod pending;

pub use bridge::{Bridge, BridgeError, BridgeHandle, BridgeStats};
pub use config::{BridgeSettings, Cli, ConfigError, ReflexConfig};
pub use offline_queue::{OfflineQueue, PersistenceError, QueueEntry};
