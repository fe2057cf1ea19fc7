//! Per-metric aggregation state.
//!
//! An [`Aggregator`] owns the accumulated value of one metric name and is
//! flushed on its own timer. `add` and `flush` take the same lock, so an add
//! racing a flush lands either in the flushed value or in the next interval,
//! never in both and never nowhere.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::metrics::{Metric, MetricKind, Tags};
use crate::sink::MetricsSink;

/// Accumulated value, dispatched on the metric kind.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Accumulator {
    Counter { total: f64 },
    Gauge { value: f64 },
}

impl Accumulator {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Accumulator::Counter { total: 0.0 },
            MetricKind::Gauge => Accumulator::Gauge { value: 0.0 },
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Accumulator::Counter { .. } => MetricKind::Counter,
            Accumulator::Gauge { .. } => MetricKind::Gauge,
        }
    }

    fn add(&mut self, observed: f64) {
        match self {
            Accumulator::Counter { total } => *total += observed,
            Accumulator::Gauge { value } => *value = observed,
        }
    }

    /// Current value; counters restart from zero.
    fn take(&mut self) -> f64 {
        match self {
            Accumulator::Counter { total } => std::mem::take(total),
            Accumulator::Gauge { value } => *value,
        }
    }
}

#[derive(Debug)]
struct AggregatorState {
    accumulator: Accumulator,
    tags: Option<Tags>,
}

/// Accumulator for one named metric.
#[derive(Debug)]
pub struct Aggregator {
    name: String,
    kind: MetricKind,
    state: Mutex<AggregatorState>,
}

impl Aggregator {
    /// Create an idle aggregator.
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: Mutex::new(AggregatorState {
                accumulator: Accumulator::new(kind),
                tags: None,
            }),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counter or gauge, fixed at creation.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Fold one observed value in. Tags, when given, replace the previous ones.
    pub fn add(&self, value: f64, tags: Option<Tags>) {
        let mut state = self.state.lock();
        state.accumulator.add(value);
        if tags.is_some() {
            state.tags = tags;
        }
    }

    /// Produce the aggregate for the elapsed interval.
    pub fn flush(&self) -> Metric {
        let mut state = self.state.lock();
        let value = state.accumulator.take();
        Metric {
            name: self.name.clone(),
            tags: state.tags.clone(),
            value,
            timestamp: SystemTime::now(),
            kind: state.accumulator.kind(),
        }
    }

    /// Flush every `interval` into `sinks` until `cancel` fires, then flush once more.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        sinks: Arc<[Arc<dyn MetricsSink>]>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_into(&sinks);
                }
                _ = cancel.cancelled() => {
                    trace!(metric = %self.name, "aggregator stopping");
                    self.flush_into(&sinks);
                    return;
                }
            }
        }
    }

    fn flush_into(&self, sinks: &[Arc<dyn MetricsSink>]) {
        let metric = self.flush();
        trace!(metric = %metric.name, value = metric.value, "flushed");
        for sink in sinks {
            sink.emit(&metric);
        }
    }
}
