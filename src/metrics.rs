//! Metric events and the producer side of the shared metric channel.
//!
//! Every subsystem holds a [`MetricsEmitter`] and sends [`Metric`] values into
//! one bounded channel consumed by the
//! [`MetricsService`](crate::metrics_service::MetricsService). A full channel
//! makes ingestion wait; the query path uses [`MetricsEmitter::try_emit`] and
//! drops the metric instead.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Counter of stream entries read by the ingestion pipeline.
pub const NB_RECORD: &str = "nb-record";
/// Counter of stream entries dropped after the store kept failing.
pub const NB_RECORD_DROPPED: &str = "nb-record-dropped";
/// Counter of stored records that could not be converted at query time.
pub const NB_RECORD_UNSUPPORTED: &str = "nb-record-unsupported";
/// Gauge of keys held by the store.
pub const NB_DOMAIN: &str = "nb-domain";
/// Counter of record stream reconnects, tagged with the reason.
pub const NB_STREAM_RECONNECT: &str = "nb-stream-reconnect";

/// Metric labels.
pub type Tags = BTreeMap<String, String>;

/// How an aggregator folds successive values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Summed over the interval, reset after each flush.
    Counter,
    /// Last value wins, kept across flushes.
    Gauge,
}

/// One observation, or one flushed aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    /// Metric name; one aggregator exists per name.
    pub name: String,
    /// Optional labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    /// Observed or aggregated value.
    pub value: f64,
    /// Observation or flush time.
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: SystemTime,
    /// Counter or gauge.
    pub kind: MetricKind,
}

impl Metric {
    /// A metric observed now.
    pub fn new(name: impl Into<String>, tags: Option<Tags>, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            tags,
            value,
            timestamp: SystemTime::now(),
            kind,
        }
    }

    /// A counter increment observed now.
    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, None, value, MetricKind::Counter)
    }

    /// A gauge reading observed now.
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, None, value, MetricKind::Gauge)
    }

    /// Attach one label.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(Tags::new)
            .insert(key.into(), value.into());
        self
    }
}

fn serialize_timestamp<S: Serializer>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let millis = ts
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    serializer.serialize_u64(millis)
}

/// Create the shared metric channel.
pub fn channel(capacity: usize) -> (MetricsEmitter, mpsc::Receiver<Metric>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        MetricsEmitter {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Cloneable producer handle for the metric channel.
#[derive(Debug, Clone)]
pub struct MetricsEmitter {
    tx: mpsc::Sender<Metric>,
    dropped: Arc<AtomicU64>,
}

impl MetricsEmitter {
    /// Send a metric, waiting for capacity.
    ///
    /// Metrics are dropped once the service has stopped.
    pub async fn emit(&self, metric: Metric) {
        if let Err(e) = self.tx.send(metric).await {
            debug!(metric = %e.0.name, "metrics service stopped, dropping metric");
        }
    }

    /// Send a metric if the channel has room, otherwise drop it.
    ///
    /// Returns false when the metric was dropped.
    pub fn try_emit(&self, metric: Metric) -> bool {
        match self.tx.try_send(metric) {
            Ok(()) => true,
            Err(TrySendError::Full(metric)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(metric = %metric.name, dropped, "metric channel full, dropping metric");
                false
            }
            Err(TrySendError::Closed(metric)) => {
                debug!(metric = %metric.name, "metrics service stopped, dropping metric");
                false
            }
        }
    }

    /// Metrics dropped by [`MetricsEmitter::try_emit`] on a full channel, across all clones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Increment a counter by `value`.
    pub async fn counter(&self, name: &str, value: f64) {
        self.emit(Metric::counter(name, value)).await;
    }

    /// Set a gauge.
    pub async fn gauge(&self, name: &str, value: f64) {
        self.emit(Metric::gauge(name, value)).await;
    }
}

/// Outcome of a query, as reported in `query-<branch>-<outcome>` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    /// Query returned records.
    Success,
    /// Domain not found.
    NxDomain,
    /// Domain exists but has no records of the requested type.
    NoData,
    /// No route for the name (no upstream configured).
    Refused,
    /// Lookup failed.
    Error,
}

impl QueryResult {
    /// Name used in metric names.
    pub fn as_str(self) -> &'static str {
        match self {
            QueryResult::Success => "success",
            QueryResult::NxDomain => "nxdomain",
            QueryResult::NoData => "nodata",
            QueryResult::Refused => "refused",
            QueryResult::Error => "error",
        }
    }
}

/// Which side of the zone router answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Answered from the local store.
    Local,
    /// Relayed from the upstream resolver.
    Forward,
}

impl Branch {
    /// Name used in metric names.
    pub fn as_str(self) -> &'static str {
        match self {
            Branch::Local => "local",
            Branch::Forward => "forward",
        }
    }
}

/// Record a resolved query: an outcome counter and a latency gauge.
///
/// Never waits on the channel, so a slow metrics consumer cannot delay answers.
pub fn record_query(
    emitter: &MetricsEmitter,
    branch: Branch,
    record_type: &str,
    result: QueryResult,
    duration: Duration,
) {
    let outcome = format!("query-{}-{}", branch.as_str(), result.as_str());
    emitter.try_emit(Metric::counter(outcome, 1.0).with_tag("type", record_type));

    let latency = format!("query-{}-latency-ms", branch.as_str());
    emitter.try_emit(Metric::gauge(latency, duration.as_secs_f64() * 1000.0));
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
