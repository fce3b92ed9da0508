//! Persistent configuration
//!
//! Stored as JSON in `~/.crosslink/config.json`. Every field has a default so
//! partial or older files keep loading.

use crate::platform;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Default host port, shared with the mobile app and browser extension
pub const DEFAULT_PORT: u16 = 9000;

/// Binary budget per `file_chunk` before base64 encoding
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Whether a pairing token survives its first use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenPolicy {
    /// Token stays valid until the host regenerates it
    #[default]
    Reusable,
    /// First redemption consumes the token; the peer gets its own reconnect token
    SingleUse,
}

/// Exponential backoff settings for auto-reconnect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the host listens on
    pub port: u16,
    /// Advertised as `host` in the pairing payload
    pub host_type: Option<String>,
    /// Where received files are written (None = platform downloads dir)
    pub download_dir: Option<PathBuf>,
    pub chunk_size: usize,
    /// Largest `file_start.size` the host accepts
    pub max_file_size: u64,
    pub token_policy: TokenPolicy,
    pub handshake_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
    pub auto_connect_grace_secs: u64,
    /// Passes over the device list before the auto-connect driver gives up
    pub auto_connect_rounds: u32,
    pub command_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host_type: Some(platform::hostname()),
            download_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: 2 * 1024 * 1024 * 1024,
            token_policy: TokenPolicy::default(),
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 15,
            idle_timeout_secs: 45,
            reconnect: ReconnectConfig::default(),
            auto_connect_grace_secs: 3,
            auto_connect_rounds: 2,
            command_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(platform::downloads_dir)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn auto_connect_grace(&self) -> Duration {
        Duration::from_secs(self.auto_connect_grace_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Apply `CROSSLINK_PORT` / `CROSSLINK_DOWNLOAD_DIR` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("CROSSLINK_PORT") {
            match port.trim().parse() {
                Ok(p) => self.port = p,
                Err(_) => tracing::warn!("Ignoring invalid CROSSLINK_PORT: {}", port),
            }
        }
        if let Ok(dir) = std::env::var("CROSSLINK_DOWNLOAD_DIR") {
            if !dir.is_empty() {
                self.download_dir = Some(PathBuf::from(dir));
            }
        }
        self
    }
}

/// Get the config file path (cross-platform)
pub fn config_path() -> PathBuf {
    platform::config_dir().join("config.json")
}

/// Path of the persisted device registry
pub fn registry_path() -> PathBuf {
    platform::config_dir().join("devices.json")
}

/// Load configuration, falling back to defaults when the file is missing or invalid.
pub fn load_config() -> Config {
    load_config_from(&config_path()).with_env_overrides()
}

pub fn load_config_from(path: &std::path::Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            return Config::default();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!("Invalid config {}: {}, using defaults", path.display(), e);
        Config::default()
    })
}
