//! Kafka source backed by rskafka partition clients.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use rskafka::client::error::{Error as ClientError, ProtocolError};
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{SourceConfig, StartOffset};
use crate::error::{KafkaConnectSnafu, KafkaFetchSnafu, SourceError};

use super::{Record, RecordSource};

/// Connect to the bootstrap brokers.
pub(super) async fn connect(brokers: &[String]) -> Result<Client, SourceError> {
    let client = ClientBuilder::new(brokers.to_vec())
        .build()
        .await
        .context(KafkaConnectSnafu)?;
    info!("Connected to Kafka brokers: {}", brokers.join(","));
    Ok(client)
}

/// The requested offset was deleted by retention or lies past the end of the log.
fn is_offset_out_of_range(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::ServerError {
            protocol_error: ProtocolError::OffsetOutOfRange,
            ..
        }
    )
}

struct PartitionCursor {
    partition: i32,
    client: PartitionClient,
    /// Next offset to fetch; resolved from the broker on first poll when unset.
    next_offset: Option<i64>,
}

/// Consumes a fixed set of partitions of one topic.
///
/// Offsets are tracked locally and never committed to the broker; the
/// pipeline keeps its own checkpoints.
pub struct KafkaSource {
    topic: String,
    cursors: Vec<PartitionCursor>,
    start_offset: StartOffset,
    max_records: usize,
    fetch_max_bytes: i32,
}

impl KafkaSource {
    pub async fn new(
        client: &Client,
        config: &SourceConfig,
        partitions: &[i32],
    ) -> Result<Self, SourceError> {
        let mut cursors = Vec::with_capacity(partitions.len());
        for &partition in partitions {
            let partition_client = client
                .partition_client(config.topic.clone(), partition, UnknownTopicHandling::Error)
                .await
                .context(KafkaFetchSnafu { partition })?;
            cursors.push(PartitionCursor {
                partition,
                client: partition_client,
                next_offset: None,
            });
        }

        Ok(Self {
            topic: config.topic.clone(),
            cursors,
            start_offset: config.start_offset,
            max_records: config.max_poll_records,
            fetch_max_bytes: config.fetch_max_bytes.max(1),
        })
    }

    async fn resolve_start_offsets(&mut self) -> Result<(), SourceError> {
        let start = self.start_offset;
        let at = || match start {
            StartOffset::Earliest => OffsetAt::Earliest,
            StartOffset::Latest => OffsetAt::Latest,
        };
        for cursor in self.cursors.iter_mut().filter(|c| c.next_offset.is_none()) {
            let offset = cursor
                .client
                .get_offset(at())
                .await
                .context(KafkaFetchSnafu {
                    partition: cursor.partition,
                })?;
            debug!(
                "[poll] {}/{} starting at offset {}",
                self.topic, cursor.partition, offset
            );
            cursor.next_offset = Some(offset);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Record>, SourceError> {
        self.resolve_start_offsets().await?;

        let max_wait_ms = i32::try_from(max_wait.as_millis()).unwrap_or(i32::MAX);
        let fetch_max_bytes = self.fetch_max_bytes;
        let per_partition = self.max_records.div_ceil(self.cursors.len().max(1)).max(1);

        let fetches = self.cursors.iter().map(|cursor| {
            let offset = cursor.next_offset.unwrap_or_default();
            async move {
                cursor
                    .client
                    .fetch_records(offset, 1..fetch_max_bytes, max_wait_ms)
                    .await
            }
        });
        let results = join_all(fetches).await;

        let mut records = Vec::new();
        let mut failure = None;
        for (cursor, result) in self.cursors.iter_mut().zip(results) {
            let fetched = match result {
                Ok((fetched, _high_watermark)) => fetched,
                Err(e) if is_offset_out_of_range(&e) => {
                    warn!(
                        "[poll] Offset {} out of range for {}/{}, resetting to {:?}",
                        cursor.next_offset.unwrap_or_default(),
                        self.topic,
                        cursor.partition,
                        self.start_offset
                    );
                    cursor.next_offset = None;
                    continue;
                }
                Err(e) => {
                    warn!("[poll] Fetch failed for partition {}: {}", cursor.partition, e);
                    failure.get_or_insert((cursor.partition, e));
                    continue;
                }
            };

            let from = cursor.next_offset.unwrap_or_default();
            for fetched in fetched
                .into_iter()
                .filter(|r| r.offset >= from)
                .take(per_partition)
            {
                cursor.next_offset = Some(fetched.offset + 1);
                records.push(Record {
                    partition: cursor.partition,
                    offset: fetched.offset,
                    key: fetched.record.key.map(Bytes::from),
                    value: fetched.record.value.map(Bytes::from).unwrap_or_default(),
                    timestamp: fetched.record.timestamp,
                });
            }
        }

        // Partial success still returns what was read; the failed partitions
        // are retried on the next poll.
        match failure {
            Some((partition, source)) if records.is_empty() => {
                Err(SourceError::KafkaFetch { partition, source })
            }
            _ => Ok(records),
        }
    }

    fn assignment(&self) -> BTreeSet<i32> {
        self.cursors.iter().map(|c| c.partition).collect()
    }

    fn seek(&mut self, partition: i32, next_offset: i64) {
        if let Some(cursor) = self.cursors.iter_mut().find(|c| c.partition == partition) {
            cursor.next_offset = Some(next_offset);
        }
    }
}
