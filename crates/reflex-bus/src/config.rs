use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable holding the initial kill switch state
pub const KILL_SWITCH_ENV: &str = "REFLEX_KILL_SWITCH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Start muted: events are audited but not dispatched
    #[serde(default)]
    pub muted: bool,
    /// Audit log file (default: stdout)
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Capacity of the dispatch queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Source stamped on events built by `Bus::emit`
    #[serde(default = "default_source")]
    pub source: String,
    /// Channel stamped on events built by `Bus::emit`
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_source() -> String {
    "reflex".to_string()
}

fn default_channel() -> String {
    "reflex".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            muted: false,
            log_path: None,
            queue_capacity: default_queue_capacity(),
            source: default_source(),
            channel: default_channel(),
        }
    }
}

impl BusConfig {
    /// Apply the kill switch from the environment, if set
    pub fn with_env(mut self) -> Self {
        if let Ok(value) = std::env::var(KILL_SWITCH_ENV) {
            self.muted = parse_flag(&value);
        }
        self
    }
}

/// Interpret an environment flag (`1`, `true`, `yes`, `on`)
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert!(!config.muted);
        assert!(config.log_path.is_none());
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.channel, "reflex");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BusConfig = serde_json::from_str(r#"{"muted": true}"#).unwrap();
        assert!(config.muted);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.source, "reflex");
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag(""));
    }
}
