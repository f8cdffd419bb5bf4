//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TANDEM_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tandem_core::{BrokerConfig, RelayConfig, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Endpoint paths.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Endpoint paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Signaling WebSocket.
    #[serde(default = "default_signaling_path")]
    pub signaling: String,

    /// Prefix of the live collaboration WebSocket; the document name follows.
    #[serde(default = "default_collab_path")]
    pub collab: String,

    /// Poll endpoint.
    #[serde(default = "default_poll_path")]
    pub poll: String,

    /// Session reset endpoint.
    #[serde(default = "default_reset_path")]
    pub reset: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum topics a signaling connection may join.
    #[serde(default = "default_max_topics")]
    pub max_topics_per_connection: usize,

    /// Per-room broadcast buffer for live sessions.
    #[serde(default = "default_room_capacity")]
    pub room_broadcast_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TANDEM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TANDEM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_signaling_path() -> String {
    "/".to_string()
}

fn default_collab_path() -> String {
    "/collab".to_string()
}

fn default_poll_path() -> String {
    "/poll".to_string()
}

fn default_reset_path() -> String {
    "/reset".to_string()
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB, full document states travel on the live socket
}

fn default_max_topics() -> usize {
    100
}

fn default_room_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    std::env::var("TANDEM_HEARTBEAT_MS")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(30_000) // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            paths: PathsConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            signaling: default_signaling_path(),
            collab: default_collab_path(),
            poll: default_poll_path(),
            reset: default_reset_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_topics_per_connection: default_max_topics(),
            room_broadcast_capacity: default_room_capacity(),
        }
    }
}

impl LimitsConfig {
    /// Largest poll body accepted: a base64 snapshot of
    /// `max_message_size` bytes plus room for the JSON around it.
    #[must_use]
    pub fn max_poll_body(&self) -> usize {
        self.max_message_size.div_ceil(3) * 4 + 1024
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tandem.toml",
            "/etc/tandem/tandem.toml",
            "~/.config/tandem/tandem.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Relay settings derived from this configuration.
    #[must_use]
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms.max(1)),
            broker: BrokerConfig {
                max_topics_per_connection: self.limits.max_topics_per_connection,
            },
        }
    }

    /// Document store settings derived from this configuration.
    #[must_use]
    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            broadcast_capacity: self.limits.room_broadcast_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = Config::default();
        assert_eq!(config.paths.signaling, "/");
        assert_eq!(config.paths.collab, "/collab");
        assert_eq!(config.paths.poll, "/poll");
        assert_eq!(config.paths.reset, "/reset");
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 4444;
        assert_eq!(config.bind_addr().unwrap().port(), 4444);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [paths]
            collab = "/yjs"

            [limits]
            max_topics_per_connection = 5

            [heartbeat]
            interval_ms = 1500
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.paths.collab, "/yjs");
        assert_eq!(config.paths.poll, "/poll");

        let relay = config.relay();
        assert_eq!(relay.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(relay.broker.max_topics_per_connection, 5);
        assert_eq!(config.store().broadcast_capacity, 256);
    }
}
