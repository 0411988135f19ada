use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use reflex_bus::BusConfig;
use reflex_protocol::{BRIDGED_PREFIXES, TopicPattern};
use serde::{Deserialize, Serialize};
use url::Url;

/// Command line for the bridge binary. Every flag can also come from the environment.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "reflex-bridge", version, about = "Bridge the reflex bus to a remote event service")]
pub struct Cli {
    /// Config file (default: ~/.reflex/config.toml)
    #[arg(long, env = "REFLEX_CONFIG")]
    pub config: Option<PathBuf>,
    /// WebSocket URL of the remote event service
    #[arg(long, env = "REFLEX_BRIDGE_URL")]
    pub url: Option<String>,
    /// Offline queue file
    #[arg(long, env = "REFLEX_BRIDGE_QUEUE")]
    pub queue: Option<PathBuf>,
    /// Role announced in the identify message
    #[arg(long, env = "REFLEX_BRIDGE_ROLE")]
    pub role: Option<String>,
    /// Bus audit log file (default: stdout)
    #[arg(long = "log", env = "REFLEX_BUS_LOG")]
    pub log: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(
        "bridge URL not configured. Set REFLEX_BRIDGE_URL, pass --url or configure [bridge] url in ~/.reflex/config.toml"
    )]
    MissingUrl,
    #[error("invalid bridge URL `{url}`: {source}")]
    InvalidUrl { url: String, source: url::ParseError },
    #[error("bridge URL must use ws:// or wss://, got `{0}`")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflexConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// WebSocket URL (e.g., ws://127.0.0.1:8765/bridge)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Deadline for connecting and for each send
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// WebSocket keep-alive period, 0 disables pings
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Local topics forwarded to the remote side
    #[serde(default = "default_topic_prefixes")]
    pub topic_prefixes: Vec<String>,
}

fn default_role() -> String {
    "reflex-bridge".to_string()
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("logs/reflex_bridge_queue.jsonl")
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    20_000
}

fn default_topic_prefixes() -> Vec<String> {
    BRIDGED_PREFIXES.iter().map(|p| p.to_string()).collect()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            url: None,
            role: default_role(),
            queue_path: default_queue_path(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            topic_prefixes: default_topic_prefixes(),
        }
    }
}

impl BridgeSettings {
    /// Parsed and scheme-checked remote URL
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let raw = self.url.as_deref().ok_or(ConfigError::MissingUrl)?;
        let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    /// Outbound patterns; entries are prefixes whether or not they end in `*`
    pub fn topic_patterns(&self) -> Vec<TopicPattern> {
        self.topic_prefixes
            .iter()
            .map(|p| TopicPattern::Prefix(p.trim_end_matches('*').to_string()))
            .collect()
    }
}

impl ReflexConfig {
    /// Load config in layers: defaults, file, command line / environment.
    ///
    /// A missing default config file is fine; a missing `--config` file is not.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_cli(cli);
        config.bus = config.bus.with_env();
        config.bridge.endpoint()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(url) = &cli.url {
            self.bridge.url = Some(url.clone());
        }
        if let Some(queue) = &cli.queue {
            self.bridge.queue_path = queue.clone();
        }
        if let Some(role) = &cli.role {
            self.bridge.role = role.clone();
        }
        if let Some(log) = &cli.log {
            self.bus.log_path = Some(log.clone());
        }
    }

    fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".reflex/config.toml")
    }
}
