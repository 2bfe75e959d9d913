//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (HERALD_HOST, HERALD_PORT)
//! - TOML configuration file

use anyhow::{Context, Result};
use herald_core::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the HTTP push API.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Subscriber endpoint configuration.
    #[serde(default)]
    pub subscriber: SubscriberConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Private message storage.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Subscriber endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// WebSocket port for subscribers.
    #[serde(default = "default_subscriber_port")]
    pub port: u16,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_inbound_size")]
    pub max_message_size: usize,

    /// Seconds one outbound frame may take before the connection is dropped.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Seconds a client may take to complete the WebSocket upgrade.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Resource limits configuration.
///
/// A push blocks while any member's outbound queue is full, and blocks the
/// rest of that key's operations with it, so `message_buffer` is the number
/// of messages a stalled client can absorb before it stalls its key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connections per subscriber key.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers_per_channel: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_message_buffer")]
    pub message_buffer: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval assumed when a client does not announce one, in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub default_interval_secs: u64,

    /// Smallest interval a client may announce, in seconds.
    #[serde(default = "default_heartbeat_min")]
    pub min_interval_secs: u64,

    /// Largest interval a client may announce, in seconds.
    #[serde(default = "default_heartbeat_max")]
    pub max_interval_secs: u64,
}

/// Storage backend for private messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process store with expiry.
    Memory,
    /// No storage; persistent pushes fail.
    Disabled,
}

/// Private message storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use.
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,

    /// Messages retained per key.
    #[serde(default = "default_max_messages_per_key")]
    pub max_messages_per_key: usize,

    /// How often expired messages are purged, in seconds.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
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
    std::env::var("HERALD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HERALD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_subscriber_port() -> u16 {
    8090
}

fn default_max_inbound_size() -> usize {
    4 * 1024 // 4 KB
}

fn default_write_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_max_subscribers() -> usize {
    64
}

fn default_message_buffer() -> usize {
    64
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_min() -> u64 {
    5
}

fn default_heartbeat_max() -> u64 {
    300
}

fn default_store_kind() -> StoreKind {
    StoreKind::Memory
}

fn default_max_messages_per_key() -> usize {
    128
}

fn default_purge_interval() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            subscriber: SubscriberConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            port: default_subscriber_port(),
            max_message_size: default_max_inbound_size(),
            write_timeout_secs: default_write_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscribers_per_channel: default_max_subscribers(),
            message_buffer: default_message_buffer(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_heartbeat_interval(),
            min_interval_secs: default_heartbeat_min(),
            max_interval_secs: default_heartbeat_max(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            max_messages_per_key: default_max_messages_per_key(),
            purge_interval_secs: default_purge_interval(),
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

impl HeartbeatConfig {
    /// How long a connection may stay silent before it is dropped.
    ///
    /// Twice the client's announced interval, clamped to the configured
    /// bounds.
    #[must_use]
    pub fn timeout_for(&self, announced: Option<u64>) -> Duration {
        let interval = announced
            .unwrap_or(self.default_interval_secs)
            .clamp(self.min_interval_secs, self.max_interval_secs.max(self.min_interval_secs));
        Duration::from_secs(interval * 2)
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
            "herald.toml",
            "/etc/herald/herald.toml",
            "~/.config/herald/herald.toml",
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

    /// Get the socket address of the HTTP API.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Get the socket address of the subscriber endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn subscriber_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.subscriber.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.subscriber.port))
    }

    /// Channel limits derived from this configuration.
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_subscribers_per_channel: self.limits.max_subscribers_per_channel,
            message_buffer: self.limits.message_buffer,
        }
    }
}
