//! Client config load/save for `~/.chat-stream/config.yaml`.
//!
//! ```yaml
//! server:
//!   url: ws://127.0.0.1:8765/ws
//!   connect_timeout_secs: 10
//! reconnect:
//!   base_delay_ms: 1000
//!   max_delay_ms: 10000
//!   max_attempts: 5
//! session:
//!   poll_interval_secs: 30
//!   stream_delay: 0.03
//!   context: {}
//!   metadata: {}
//! ```
//!
//! Every section and key is optional; missing values take the defaults above.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::messages::{Metadata, RequestOptions, DEFAULT_STREAM_DELAY};
use crate::session::SessionConfig;

/// Where to connect and how long to wait for the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub url: String,
    pub connect_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Backoff constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

/// Metrics polling and per-request defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub poll_interval_secs: u64,
    pub stream_delay: f64,
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub context: Metadata,
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stream_delay: DEFAULT_STREAM_DELAY,
            context: Metadata::new(),
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub session: SessionSection,
}

impl Config {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            backoff: self.backoff(),
            poll_interval: Duration::from_secs(self.session.poll_interval_secs),
            defaults: RequestOptions {
                context: self.session.context.clone(),
                metadata: self.session.metadata.clone(),
                stream_delay: Some(self.session.stream_delay),
            },
        }
    }
}

/// Returns the default config file path: `~/.chat-stream/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    Some(home.join(".chat-stream").join("config.yaml"))
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Config load/save error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
