//! Registry of aggregators fed from the shared metric channel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::metrics::{Metric, MetricKind};
use crate::sink::MetricsSink;

/// Lazily creates one [`Aggregator`] per metric name and routes metrics to it.
///
/// Aggregators are never removed; metric names come from code paths, not
/// from input data. Creating an aggregator spawns its flush loop, so the
/// service must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct MetricsService {
    aggregators: Arc<Mutex<HashMap<String, Arc<Aggregator>>>>,
    flush_interval: Duration,
    sinks: Arc<[Arc<dyn MetricsSink>]>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MetricsService {
    /// Create a service flushing every `flush_interval` into `sinks`.
    pub fn new(flush_interval: Duration, sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self {
            aggregators: Arc::new(Mutex::new(HashMap::new())),
            flush_interval,
            sinks: sinks.into(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Return the aggregator for `name`, creating and starting it on first use.
    ///
    /// `kind` is only consulted on creation.
    pub fn get_or_create(&self, name: &str, kind: MetricKind) -> Arc<Aggregator> {
        let mut aggregators = self.aggregators.lock();
        if let Some(aggregator) = aggregators.get(name) {
            return aggregator.clone();
        }

        debug!(metric = name, ?kind, "creating aggregator");
        let aggregator = Arc::new(Aggregator::new(name, kind));
        self.tasks.spawn(aggregator.clone().run(
            self.flush_interval,
            self.sinks.clone(),
            self.cancel.child_token(),
        ));
        aggregators.insert(name.to_string(), aggregator.clone());
        aggregator
    }

    /// Return the aggregator for `name` if one was created.
    pub fn get(&self, name: &str) -> Option<Arc<Aggregator>> {
        self.aggregators.lock().get(name).cloned()
    }

    /// Number of registered aggregators.
    pub fn len(&self) -> usize {
        self.aggregators.lock().len()
    }

    /// True when no metric has been observed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one observed metric to its aggregator.
    pub fn observe(&self, metric: Metric) {
        self.get_or_create(&metric.name, metric.kind)
            .add(metric.value, metric.tags);
    }

    /// Consume the metric channel until every producer is gone or `cancel` fires.
    ///
    /// On exit all aggregators flush one last time before this returns.
    pub async fn run(self, mut rx: mpsc::Receiver<Metric>, cancel: CancellationToken) {
        info!(flush_interval = ?self.flush_interval, "metrics service started");

        loop {
            tokio::select! {
                metric = rx.recv() => match metric {
                    Some(metric) => self.observe(metric),
                    None => {
                        debug!("metric channel closed");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    // Take what producers already queued.
                    while let Ok(metric) = rx.try_recv() {
                        self.observe(metric);
                    }
                    break;
                }
            }
        }

        self.shutdown().await;
        info!(aggregators = self.len(), "metrics service stopped");
    }

    /// Stop every flush loop after a final flush.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
