//! stream-dns - A DNS server whose records arrive on a message stream.
//!
//! Domain records are published to a Kafka topic keyed by domain name. This
//! crate consumes that topic into a local embedded key-value store and answers
//! DNS queries for configured zones from it, forwarding every other name to an
//! upstream resolver. Operational counters are aggregated in-process and
//! flushed on a fixed interval.
//!
//! ## Features
//!
//! - At-least-once ingestion with bounded write retries
//! - Exact-name and wildcard (`*.zone.`) answers from the store
//! - Longest-suffix routing between local zones and the upstream resolver
//! - Interval-flushed counters and gauges, with a final flush on shutdown
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           stream-dns                             │
//! │                                                                  │
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────────────────┐  │
//! │  │ Kafka source │───▶│ IngestPipe-  │───▶│  Store (redb)      │  │
//! │  │ (partition)  │    │ line         │    │  key: domain name  │  │
//! │  └──────────────┘    └──────┬───────┘    └─────────┬──────────┘  │
//! │                             │ metrics              │             │
//! │                             ▼                      ▼             │
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────────────────┐  │
//! │  │ Sinks (log,  │◀───│ Metrics      │◀───│  Hickory catalog   │◀── UDP/TCP
//! │  │ stdout, ...) │    │ service      │    │  zones ─▶ store    │  │
//! │  └──────────────┘    └──────────────┘    │  root  ─▶ upstream │  │
//! │                                          └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use stream_dns::{kafka, Config, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), stream_dns::DnsError> {
//!     let config = Config::load(Some("stream-dns.toml".as_ref()))?;
//!     let stream = config.stream.clone();
//!     let connect = move |resume| {
//!         let stream = stream.clone();
//!         async move { kafka::connect(&stream, resume).await }
//!     };
//!
//!     let cancel = CancellationToken::new();
//!     DnsServer::new(config).run(connect, cancel).await
//! }
//! ```

#![warn(missing_docs)]

pub mod aggregator;
pub mod authority;
pub mod config;
pub mod error;
pub mod forward;
pub mod ingest;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod metrics;
pub mod metrics_service;
pub mod record;
pub mod router;
pub mod server;
pub mod sink;
pub mod store;
pub mod telemetry;

// Re-export main types
pub use config::{Config, DnsConfig, MetricsConfig, StoreConfig, StreamConfig, TelemetryConfig};
pub use error::DnsError;
pub use ingest::{IngestPipeline, StreamEntry};
pub use record::{RecordPayload, StreamRecord};
pub use router::{Route, ZoneRouter};
pub use server::DnsServer;
pub use store::{RecordWriter, Store};
