//! Destinations for flushed metrics.

use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::OutputKind;
use crate::metrics::{Metric, MetricKind};

/// Receives every flushed aggregate.
pub trait MetricsSink: Send + Sync {
    /// Write one flushed metric.
    fn emit(&self, metric: &Metric);
}

/// Build the sinks named in the configuration.
pub fn from_outputs(outputs: &[OutputKind]) -> Vec<Arc<dyn MetricsSink>> {
    outputs
        .iter()
        .map(|output| -> Arc<dyn MetricsSink> {
            match output {
                OutputKind::Log => Arc::new(LogSink),
                OutputKind::Stdout => Arc::new(StdoutSink),
                OutputKind::Recorder => Arc::new(RecorderSink),
            }
        })
        .collect()
}

/// Logs each metric as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn emit(&self, metric: &Metric) {
        info!(
            target: "stream_dns::metrics",
            name = %metric.name,
            kind = ?metric.kind,
            value = metric.value,
            tags = ?metric.tags,
            "metric"
        );
    }
}

/// Writes each metric as one JSON line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl MetricsSink for StdoutSink {
    fn emit(&self, metric: &Metric) {
        let line = match serde_json::to_string(metric) {
            Ok(line) => line,
            Err(e) => {
                warn!(name = %metric.name, "failed to encode metric: {}", e);
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}") {
            warn!("failed to write metric to stdout: {}", e);
        }
    }
}

/// Forwards flushed metrics into the `metrics` facade.
///
/// Counter flushes carry the delta of one interval and are added to a
/// monotonic counter; gauges are set.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderSink;

/// Whole increment for a counter delta. Negative deltas add nothing.
fn counter_increment(value: f64) -> u64 {
    value.round() as u64
}

impl MetricsSink for RecorderSink {
    fn emit(&self, metric: &Metric) {
        let labels: Vec<::metrics::Label> = metric
            .tags
            .iter()
            .flatten()
            .map(|(k, v)| ::metrics::Label::new(k.clone(), v.clone()))
            .collect();

        match metric.kind {
            MetricKind::Counter => {
                ::metrics::counter!(metric.name.clone(), labels).increment(counter_increment(metric.value))
            }
            MetricKind::Gauge => ::metrics::gauge!(metric.name.clone(), labels).set(metric.value),
        }
    }
}

/// Keeps flushed metrics in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    metrics: Mutex<Vec<Metric>>,
}

impl MemorySink {
    /// Everything flushed so far.
    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics.lock().clone()
    }

    /// Values flushed for one metric name, oldest first.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.metrics
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.value)
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn emit(&self, metric: &Metric) {
        self.metrics.lock().push(metric.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_outputs_builds_one_sink_per_output() {
        let sinks = from_outputs(&[OutputKind::Log, OutputKind::Stdout, OutputKind::Recorder]);
        assert_eq!(sinks.len(), 3);
    }

    #[test]
    fn test_memory_sink_filters_by_name() {
        let sink = MemorySink::default();
        sink.emit(&Metric::counter("a", 1.0));
        sink.emit(&Metric::gauge("b", 2.0));
        sink.emit(&Metric::counter("a", 3.0));

        assert_eq!(sink.values("a"), vec![1.0, 3.0]);
        assert_eq!(sink.metrics().len(), 3);
    }

    #[test]
    fn test_counter_increment_rounds_fractional_deltas() {
        assert_eq!(counter_increment(2.0), 2);
        assert_eq!(counter_increment(2.6), 3);
        assert_eq!(counter_increment(0.4), 0);
        assert_eq!(counter_increment(-1.0), 0);
    }

    #[test]
    fn test_recorder_sink_without_recorder_is_noop() {
        RecorderSink.emit(&Metric::counter("nb-record", 2.0).with_tag("type", "A"));
        RecorderSink.emit(&Metric::gauge("nb-domain", 4.0));
    }
}
