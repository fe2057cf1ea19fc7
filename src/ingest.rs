//! Stream-to-store ingestion pipeline.
//!
//! Entries are read one at a time from an ordered stream, counted, and written
//! to the store under their domain key. Delivery is at-least-once: an entry
//! read again after a restart overwrites the same key with the same value.

use futures::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DnsError;
use crate::metrics::{Metric, MetricsEmitter, NB_RECORD, NB_RECORD_DROPPED, NB_STREAM_RECONNECT};
use crate::store::RecordWriter;

/// Marker for keys that cover any subdomain.
pub const WILDCARD_MARKER: char = '*';

/// Attempts made for one store write before the entry is dropped.
const MAX_WRITE_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One message from the record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Domain name, possibly with a wildcard label.
    pub key: Vec<u8>,
    /// Serialized record payload.
    pub value: Vec<u8>,
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

impl StreamEntry {
    /// Entry without stream coordinates.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            topic: String::new(),
            partition: 0,
            offset: 0,
        }
    }

    /// Key as text, lossily decoded.
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    /// True when the key denotes "any subdomain".
    pub fn is_wildcard(&self) -> bool {
        self.key.contains(&(WILDCARD_MARKER as u8))
    }
}

/// Counts of what one pipeline run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Entries read from the stream.
    pub processed: u64,
    /// Entries whose key carried the wildcard marker.
    pub wildcards: u64,
    /// Entries dropped because the store kept failing.
    pub dropped: u64,
    /// Stream offset of the last entry read.
    pub last_offset: Option<i64>,
}

impl IngestStats {
    /// Offset to resume reading from after a reconnect.
    pub fn resume_offset(&self) -> Option<i64> {
        self.last_offset.map(|offset| offset + 1)
    }
}

impl AddAssign for IngestStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.wildcards += other.wildcards;
        self.dropped += other.dropped;
        self.last_offset = other.last_offset.or(self.last_offset);
    }
}

/// Why the record stream was reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Opening the stream failed.
    ConnectError,
    /// Reading from the stream failed.
    ReadError,
    /// The stream ended.
    Ended,
}

impl ReconnectReason {
    /// Label value of the reconnect counter.
    pub fn as_str(self) -> &'static str {
        match self {
            ReconnectReason::ConnectError => "connect-error",
            ReconnectReason::ReadError => "read-error",
            ReconnectReason::Ended => "ended",
        }
    }
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} wildcards={} dropped={}",
            self.processed, self.wildcards, self.dropped
        )
    }
}

/// Writes stream entries into the store.
pub struct IngestPipeline<W> {
    store: Arc<W>,
    metrics: MetricsEmitter,
}

impl<W: RecordWriter> IngestPipeline<W> {
    /// Create a pipeline writing into `store` and reporting to `metrics`.
    pub fn new(store: Arc<W>, metrics: MetricsEmitter) -> Self {
        Self { store, metrics }
    }

    /// Consume `source` until it ends, fails, or `cancel` fires.
    ///
    /// A read error ends the run and is returned; store failures never do.
    pub async fn run<S>(&self, source: S, cancel: CancellationToken) -> Result<IngestStats, DnsError>
    where
        S: Stream<Item = Result<StreamEntry, DnsError>> + Unpin,
    {
        let mut stats = IngestStats::default();
        self.consume(source, &cancel, &mut stats).await?;
        Ok(stats)
    }

    /// Keep ingesting from sources opened by `connect` until `cancel` fires.
    ///
    /// `connect` receives the offset following the last entry read, if any.
    /// A failed connect, a read error and the end of a source all lead to a
    /// reconnect after a capped exponential backoff, which resets once a
    /// source has delivered an entry.
    pub async fn supervise<F, Fut, S>(&self, mut connect: F, cancel: CancellationToken) -> IngestStats
    where
        F: FnMut(Option<i64>) -> Fut,
        Fut: Future<Output = Result<S, DnsError>>,
        S: Stream<Item = Result<StreamEntry, DnsError>> + Unpin,
    {
        let mut total = IngestStats::default();
        let mut backoff = RECONNECT_INITIAL_BACKOFF;

        loop {
            let connected = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                connected = connect(total.resume_offset()) => connected,
            };

            let reason = match connected {
                Ok(source) => {
                    let mut stats = IngestStats::default();
                    let result = self.consume(source, &cancel, &mut stats).await;
                    if stats.processed > 0 {
                        backoff = RECONNECT_INITIAL_BACKOFF;
                    }
                    total += stats;
                    match result {
                        Ok(()) if cancel.is_cancelled() => break,
                        Ok(()) => ReconnectReason::Ended,
                        Err(_) => ReconnectReason::ReadError,
                    }
                }
                Err(e) => {
                    error!("Failed to open record stream: {}", e);
                    ReconnectReason::ConnectError
                }
            };

            self.metrics
                .emit(Metric::counter(NB_STREAM_RECONNECT, 1.0).with_tag("reason", reason.as_str()))
                .await;
            warn!(reason = reason.as_str(), delay = ?backoff, "Reconnecting record stream");

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
        }

        info!(stats = %total, "Record ingestion stopped");
        total
    }

    async fn consume<S>(
        &self,
        mut source: S,
        cancel: &CancellationToken,
        stats: &mut IngestStats,
    ) -> Result<(), DnsError>
    where
        S: Stream<Item = Result<StreamEntry, DnsError>> + Unpin,
    {
        info!("Starting record ingestion");

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(%stats, "Record ingestion received shutdown signal");
                    return Ok(());
                }

                next = source.next() => next,
            };

            match next {
                Some(Ok(entry)) => {
                    self.process(&entry, stats).await;
                }
                Some(Err(e)) => {
                    error!(%stats, "Record stream read failed: {}", e);
                    return Err(e);
                }
                None => {
                    info!(%stats, "Record stream ended");
                    return Ok(());
                }
            }
        }
    }

    /// Count, log, and persist one entry.
    pub async fn process(&self, entry: &StreamEntry, stats: &mut IngestStats) {
        stats.processed += 1;
        stats.last_offset = Some(entry.offset);
        debug!(key = %entry.key_str(), "Got record for domain");
        self.metrics.counter(NB_RECORD, 1.0).await;

        if entry.is_wildcard() {
            stats.wildcards += 1;
            info!(
                topic = %entry.topic,
                partition = entry.partition,
                offset = entry.offset,
                key = %entry.key_str(),
                value = %String::from_utf8_lossy(&entry.value),
                "wildcard record"
            );
        }

        if let Err(e) = self.persist(entry).await {
            stats.dropped += 1;
            error!(key = %entry.key_str(), offset = entry.offset, "dropping record: {}", e);
            self.metrics.counter(NB_RECORD_DROPPED, 1.0).await;
        }
    }

    /// Write with bounded retries and exponential backoff.
    async fn persist(&self, entry: &StreamEntry) -> Result<(), DnsError> {
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let store = self.store.clone();
            let key = entry.key.clone();
            let value = entry.value.clone();

            let result = tokio::task::spawn_blocking(move || store.put(&key, &value))
                .await
                .map_err(DnsError::from)
                .and_then(|r| r);

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(key = %entry.key_str(), attempt, "store write failed, retrying: {}", e);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    warn!(key = %entry.key_str(), attempt, "store write failed: {}", e);
                }
            }
        }

        Err(DnsError::WriteExhausted {
            key: entry.key_str().into_owned(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{self, Metric};
    use crate::store::Store;
    use std::collections::VecDeque;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Fails the first `failures` writes, then records them.
    struct FlakyWriter {
        failures: AtomicU32,
        writes: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    }

    impl FlakyWriter {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl RecordWriter for FlakyWriter {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DnsError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DnsError::Io(std::io::Error::other("disk on fire")));
            }
            self.writes.lock().push((key.to_vec(), value.to_vec()));
            Ok(())
        }
    }

    fn entries(entries: Vec<StreamEntry>) -> impl Stream<Item = Result<StreamEntry, DnsError>> + Unpin {
        futures::stream::iter(entries.into_iter().map(Ok))
    }

    fn drain(rx: &mut mpsc::Receiver<Metric>) -> Vec<Metric> {
        let mut out = Vec::new();
        while let Ok(metric) = rx.try_recv() {
            out.push(metric);
        }
        out
    }

    #[test]
    fn test_wildcard_detection() {
        assert!(StreamEntry::new("*.example.com.", "").is_wildcard());
        assert!(!StreamEntry::new("www.example.com.", "").is_wildcard());
    }

    #[tokio::test]
    async fn test_entry_is_stored_and_counted() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (emitter, mut rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(store.clone(), emitter);

        let stats = pipeline
            .run(
                entries(vec![StreamEntry::new("example.com.", "v1")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(store.get(b"example.com.").unwrap(), Some(b"v1".to_vec()));

        let emitted = drain(&mut rx);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].name, NB_RECORD);
        assert_eq!(emitted[0].value, 1.0);
    }

    #[tokio::test]
    async fn test_wildcards_are_counted() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (emitter, _rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(store.clone(), emitter);

        let stats = pipeline
            .run(
                entries(vec![
                    StreamEntry::new("*.example.com.", "w"),
                    StreamEntry::new("a.example.com.", "a"),
                ]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.wildcards, 1);
        assert_eq!(store.get(b"*.example.com.").unwrap(), Some(b"w".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_failure_is_retried() {
        let writer = Arc::new(FlakyWriter::new(2));
        let (emitter, mut rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(writer.clone(), emitter);

        let stats = pipeline
            .run(
                entries(vec![StreamEntry::new("example.com.", "v1")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.dropped, 0);
        assert_eq!(writer.writes.lock().len(), 1);
        assert!(drain(&mut rx).iter().all(|m| m.name == NB_RECORD));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_entry_and_continue() {
        let writer = Arc::new(FlakyWriter::new(MAX_WRITE_ATTEMPTS));
        let (emitter, mut rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(writer.clone(), emitter);

        let stats = pipeline
            .run(
                entries(vec![
                    StreamEntry::new("lost.example.com.", "v1"),
                    StreamEntry::new("kept.example.com.", "v2"),
                ]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.dropped, 1);
        let writes = writer.writes.lock().clone();
        assert_eq!(writes, vec![(b"kept.example.com.".to_vec(), b"v2".to_vec())]);

        let names: Vec<String> = drain(&mut rx).into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec![NB_RECORD, NB_RECORD_DROPPED, NB_RECORD]);
    }

    #[tokio::test]
    async fn test_read_error_ends_run() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (emitter, _rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(store, emitter);

        let source = futures::stream::iter(vec![
            Ok(StreamEntry::new("example.com.", "v1")),
            Err(DnsError::Stream("broker gone".to_string())),
            Ok(StreamEntry::new("never.example.com.", "v2")),
        ]);

        let result = pipeline.run(source, CancellationToken::new()).await;
        assert!(matches!(result, Err(DnsError::Stream(_))));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_read() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (emitter, _rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(store, emitter);
        let cancel = CancellationToken::new();

        cancel.cancel();
        let stats = pipeline
            .run(futures::stream::pending(), cancel)
            .await
            .unwrap();
        assert_eq!(stats, IngestStats::default());
    }

    type Source = futures::stream::Iter<std::vec::IntoIter<Result<StreamEntry, DnsError>>>;

    fn source(items: Vec<Result<StreamEntry, DnsError>>) -> Source {
        futures::stream::iter(items)
    }

    fn entry_at(key: &str, value: &str, offset: i64) -> StreamEntry {
        StreamEntry {
            offset,
            ..StreamEntry::new(key, value)
        }
    }

    fn reconnect_reasons(metrics: &[Metric]) -> Vec<String> {
        metrics
            .iter()
            .filter(|m| m.name == NB_STREAM_RECONNECT)
            .map(|m| m.tags.as_ref().unwrap()["reason"].clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_reconnects_after_read_error() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (emitter, mut rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(store.clone(), emitter);
        let cancel = CancellationToken::new();

        let mut sources = VecDeque::from(vec![
            source(vec![
                Ok(entry_at("first.example.com.", "v1", 7)),
                Err(DnsError::Stream("leader changed".to_string())),
            ]),
            source(vec![Ok(entry_at("second.example.com.", "v2", 8))]),
        ]);
        let mut resumed_from = Vec::new();
        let connect_cancel = cancel.clone();
        let connect = |resume: Option<i64>| {
            resumed_from.push(resume);
            let next = sources.pop_front();
            if next.is_none() {
                connect_cancel.cancel();
            }
            async move { next.ok_or_else(|| DnsError::Stream("no broker".to_string())) }
        };

        let stats = pipeline.supervise(connect, cancel).await;

        assert_eq!(stats.processed, 2);
        assert_eq!(store.get(b"first.example.com.").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"second.example.com.").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(resumed_from, vec![None, Some(8), Some(9)]);
        assert_eq!(reconnect_reasons(&drain(&mut rx)), vec!["read-error", "ended"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_back_off_exponentially() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (emitter, _rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(store, emitter);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let mut attempts = 0;
        let connect_cancel = cancel.clone();
        let connect = |_resume: Option<i64>| {
            attempts += 1;
            if attempts == 4 {
                connect_cancel.cancel();
            }
            async { Err::<Source, _>(DnsError::Stream("connection refused".to_string())) }
        };

        let stats = pipeline.supervise(connect, cancel).await;

        assert_eq!(stats, IngestStats::default());
        // 1s + 2s + 4s before the fourth attempt.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(15), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_supervise_stops_on_cancel() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (emitter, mut rx) = metrics::channel(16);
        let pipeline = IngestPipeline::new(store, emitter);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = pipeline
            .supervise(
                |_| async { Ok::<_, DnsError>(futures::stream::pending::<Result<StreamEntry, DnsError>>()) },
                cancel,
            )
            .await;

        assert_eq!(stats, IngestStats::default());
        assert!(drain(&mut rx).is_empty());
    }
}
