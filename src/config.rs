//! Configuration types for stream-dns.

use hickory_proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DnsError;

/// Environment prefix for configuration overrides, e.g. `STREAM_DNS__DNS__ZONES`.
pub const ENV_PREFIX: &str = "STREAM_DNS";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Record stream (Kafka) configuration.
    pub stream: StreamConfig,

    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Record store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics aggregation configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from an optional TOML file layered under the environment.
    ///
    /// A file named explicitly must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, DnsError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("stream.brokers")
                    .with_list_parse_key("dns.zones")
                    .with_list_parse_key("metrics.outputs")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), DnsError> {
        if !self.dns.udp && !self.dns.tcp {
            return Err(DnsError::Config(
                "at least one of dns.udp or dns.tcp must be enabled".to_string(),
            ));
        }
        for zone in &self.dns.zones {
            Name::from_ascii(zone)
                .map_err(|e| DnsError::Config(format!("invalid zone {zone:?}: {e}")))?;
        }
        if self.metrics.channel_capacity == 0 {
            return Err(DnsError::Config(
                "metrics.channel_capacity must be positive".to_string(),
            ));
        }
        if self.metrics.flush_interval_secs == 0 {
            return Err(DnsError::Config(
                "metrics.flush_interval_secs must be positive".to_string(),
            ));
        }
        if self.metrics.state_interval_secs == 0 {
            return Err(DnsError::Config(
                "metrics.state_interval_secs must be positive".to_string(),
            ));
        }
        if self.stream.topic.is_empty() {
            return Err(DnsError::Config("stream.topic must be set".to_string()));
        }
        Ok(())
    }
}

/// Kafka topic the records are consumed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Bootstrap broker addresses (`host:port`).
    pub brokers: Vec<String>,

    /// Topic carrying domain records keyed by domain name.
    pub topic: String,

    /// Partition to consume.
    #[serde(default)]
    pub partition: i32,

    /// Where to start when no position is known.
    #[serde(default)]
    pub start_offset: StartOffset,
}

/// Initial consumer position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// Replay the partition from the beginning.
    #[default]
    Earliest,
    /// Only consume records produced after startup.
    Latest,
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS listeners.
    pub listen_addr: SocketAddr,

    /// Serve over UDP.
    #[serde(default = "default_true")]
    pub udp: bool,

    /// Serve over TCP.
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Idle timeout for TCP connections in seconds.
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,

    /// Zones answered from the local store (e.g. "example.com.").
    #[serde(default)]
    pub zones: Vec<String>,

    /// Upstream resolver for names outside every zone.
    #[serde(default)]
    pub resolver_addr: Option<SocketAddr>,

    /// Upstream exchange timeout in milliseconds.
    #[serde(default = "default_resolver_timeout")]
    pub resolver_timeout_ms: u64,
}

impl DnsConfig {
    /// Upstream exchange timeout.
    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver_timeout_ms)
    }
}

/// Record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the redb database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Metrics aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Seconds between two flushes of the same aggregator.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Capacity of the shared metric channel. Ingestion waits when it is full,
    /// queries drop their metrics instead.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Where flushed metrics are written.
    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputKind>,

    /// Seconds between two store size gauges.
    #[serde(default = "default_state_interval")]
    pub state_interval_secs: u64,
}

impl MetricsConfig {
    /// Flush interval of every aggregator.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Period of the store size gauge.
    pub fn state_interval(&self) -> Duration {
        Duration::from_secs(self.state_interval_secs)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            channel_capacity: default_channel_capacity(),
            outputs: default_outputs(),
            state_interval_secs: default_state_interval(),
        }
    }
}

/// Metrics output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Structured `tracing` event per flushed metric.
    Log,
    /// One JSON line per flushed metric on stdout.
    Stdout,
    /// Forward into the `metrics` facade (served by the Prometheus exporter).
    Recorder,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "stream_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tcp_timeout() -> u64 {
    30
}

fn default_resolver_timeout() -> u64 {
    2000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("stream-dns.redb")
}

fn default_flush_interval() -> u64 {
    3
}

fn default_channel_capacity() -> usize {
    100
}

fn default_outputs() -> Vec<OutputKind> {
    vec![OutputKind::Log]
}

fn default_state_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "stream-dns".to_string()
}
