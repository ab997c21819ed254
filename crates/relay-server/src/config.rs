//! Server configuration.
//!
//! Configuration is loaded from, in order of precedence:
//! - Environment variables (`RELAY_*`, nested keys separated by `__`)
//! - TOML configuration file
//! - Built-in defaults

use anyhow::{Context, Result};
use relay_broker::{ConsumerConfig, InitialOffset, ProducerConfig};
use relay_core::{EngineConfig, IceServer, RtcConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::GatewayConfig;

const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Keepalive configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// WebRTC configuration.
    #[serde(default)]
    pub rtc: RtcSettings,

    /// Game state broadcast configuration.
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix of the WebSocket endpoint; the producer id follows it.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Keepalive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Connection is dropped after this long without a frame, in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Bound on a single socket write, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound frames buffered per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Broker backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker.
    #[default]
    Memory,
    /// Kafka, requires the `kafka` feature.
    Kafka,
}

/// Where a new consumer group starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl From<OffsetReset> for InitialOffset {
    fn from(reset: OffsetReset) -> Self {
        match reset {
            OffsetReset::Earliest => InitialOffset::Earliest,
            OffsetReset::Latest => InitialOffset::Latest,
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,

    /// Comma-separated bootstrap servers.
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Group consuming the signaling topic.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Group consuming response and confirmation topics for the gateway.
    #[serde(default = "default_gateway_group_id")]
    pub gateway_group_id: String,

    #[serde(default = "default_signal_topic")]
    pub signal_topic: String,

    #[serde(default = "default_response_topic")]
    pub response_topic: String,

    #[serde(default = "default_message_topic")]
    pub message_topic: String,

    #[serde(default = "default_confirmation_topic")]
    pub confirmation_topic: String,

    /// Partitions per topic of the in-process broker.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    #[serde(default)]
    pub initial_offset: OffsetReset,

    /// Publish attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between publish attempts in milliseconds.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

/// A STUN or TURN server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// WebRTC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcSettings {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Public IP advertised in host candidates.
    #[serde(default)]
    pub external_ip: Option<String>,

    #[serde(default = "default_udp_port_min")]
    pub udp_port_min: u16,

    #[serde(default = "default_udp_port_max")]
    pub udp_port_max: u16,

    /// Interfaces used for gathering when no external IP is set.
    #[serde(default = "default_interface_prefixes")]
    pub interface_prefixes: Vec<String>,

    /// Upper bound on waiting for candidate gathering, in milliseconds.
    #[serde(default = "default_gathering_timeout")]
    pub gathering_timeout_ms: u64,
}

/// Game state broadcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Snapshot interval in milliseconds.
    #[serde(default = "default_broadcast_interval")]
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_ping_interval() -> u64 {
    6_000 // 6 seconds
}

fn default_read_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "relay".to_string()
}

fn default_gateway_group_id() -> String {
    "relay-gateway".to_string()
}

fn default_signal_topic() -> String {
    "rtc-signal-topic".to_string()
}

fn default_response_topic() -> String {
    "rtc-response-topic".to_string()
}

fn default_message_topic() -> String {
    "messages".to_string()
}

fn default_confirmation_topic() -> String {
    "message_confirmations".to_string()
}

fn default_partitions() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        ..Default::default()
    }]
}

fn default_udp_port_min() -> u16 {
    50_000
}

fn default_udp_port_max() -> u16 {
    50_100
}

fn default_interface_prefixes() -> Vec<String> {
    ["en", "eth", "wlan", "br-"].iter().map(|p| p.to_string()).collect()
}

fn default_gathering_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_broadcast_interval() -> u64 {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            limits: LimitsConfig::default(),
            broker: BrokerConfig::default(),
            rtc: RtcSettings::default(),
            broadcast: BroadcastConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            brokers: default_brokers(),
            group_id: default_group_id(),
            gateway_group_id: default_gateway_group_id(),
            signal_topic: default_signal_topic(),
            response_topic: default_response_topic(),
            message_topic: default_message_topic(),
            confirmation_topic: default_confirmation_topic(),
            partitions: default_partitions(),
            initial_offset: OffsetReset::default(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            external_ip: None,
            udp_port_min: default_udp_port_min(),
            udp_port_max: default_udp_port_max(),
            interface_prefixes: default_interface_prefixes(),
            gathering_timeout_ms: default_gathering_timeout(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_broadcast_interval(),
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
    /// Load configuration from the first config file found, then apply
    /// `RELAY_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file or an override cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
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
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            read_timeout: Duration::from_millis(self.heartbeat.read_timeout_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            max_connections: self.limits.max_connections,
            max_message_size: self.limits.max_message_size,
            outbound_queue: self.limits.outbound_queue,
            message_topic: self.broker.message_topic.clone(),
            signal_topic: self.broker.signal_topic.clone(),
        }
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            response_topic: self.broker.response_topic.clone(),
            gathering_timeout: Duration::from_millis(self.rtc.gathering_timeout_ms),
        }
    }

    #[must_use]
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            max_attempts: self.broker.max_attempts,
            retry_backoff: Duration::from_millis(self.broker.retry_backoff_ms),
        }
    }

    /// Consumer of the signaling topic.
    #[must_use]
    pub fn signal_consumer(&self) -> ConsumerConfig {
        ConsumerConfig::new([self.broker.signal_topic.as_str()])
    }

    /// Consumer relaying responses and confirmations to sockets.
    #[must_use]
    pub fn gateway_consumer(&self) -> ConsumerConfig {
        ConsumerConfig::new([
            self.broker.response_topic.as_str(),
            self.broker.confirmation_topic.as_str(),
        ])
    }

    #[must_use]
    pub fn rtc_config(&self) -> RtcConfig {
        RtcConfig {
            ice_servers: self
                .rtc
                .ice_servers
                .iter()
                .map(|server| IceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                })
                .collect(),
            external_ip: self.rtc.external_ip.clone().filter(|ip| !ip.is_empty()),
            udp_port_min: self.rtc.udp_port_min,
            udp_port_max: self.rtc.udp_port_max,
            interface_prefixes: self.rtc.interface_prefixes.clone(),
        }
    }
}
