//! Kafka record source.

use futures::stream::BoxStream;
use futures::StreamExt;
use rskafka::client::consumer::{StartOffset as KafkaStartOffset, StreamConsumerBuilder};
use rskafka::client::partition::UnknownTopicHandling;
use rskafka::client::ClientBuilder;
use std::sync::Arc;
use tracing::info;

use crate::config::{StartOffset, StreamConfig};
use crate::error::DnsError;
use crate::ingest::StreamEntry;

/// Longest time the broker may hold a fetch open when no record is available.
const MAX_WAIT_MS: i32 = 500;

/// Connect to the brokers and stream entries of the configured partition.
///
/// Reading starts at `resume` when given, otherwise at the configured start offset.
pub async fn connect(
    config: &StreamConfig,
    resume: Option<i64>,
) -> Result<BoxStream<'static, Result<StreamEntry, DnsError>>, DnsError> {
    if config.brokers.is_empty() {
        return Err(DnsError::Config("stream.brokers must not be empty".to_string()));
    }

    let client = ClientBuilder::new(config.brokers.clone()).build().await?;
    let partition = client
        .partition_client(
            config.topic.clone(),
            config.partition,
            UnknownTopicHandling::Retry,
        )
        .await?;

    let start = match (resume, config.start_offset) {
        (Some(offset), _) => KafkaStartOffset::At(offset),
        (None, StartOffset::Earliest) => KafkaStartOffset::Earliest,
        (None, StartOffset::Latest) => KafkaStartOffset::Latest,
    };

    info!(
        brokers = ?config.brokers,
        topic = %config.topic,
        partition = config.partition,
        resume = ?resume,
        "Reading from kafka topic"
    );

    let topic = config.topic.clone();
    let partition_id = config.partition;
    let consumer = StreamConsumerBuilder::new(Arc::new(partition), start)
        .with_max_wait_ms(MAX_WAIT_MS)
        .build();

    Ok(consumer
        .map(move |result| -> Result<StreamEntry, DnsError> {
            let (record, _high_watermark) = result?;
            Ok(StreamEntry {
                key: record.record.key.unwrap_or_default(),
                value: record.record.value.unwrap_or_default(),
                topic: topic.clone(),
                partition: partition_id,
                offset: record.offset,
            })
        })
        .boxed())
}
