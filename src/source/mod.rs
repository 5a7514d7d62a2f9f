//! Record sources.
//!
//! A source yields ordered records per partition through a bounded,
//! restartable `poll`. The read cursor only moves past records that were
//! actually returned, so a failed or cancelled poll never drops data.

mod kafka;
mod memory;
mod synthetic;

pub use kafka::KafkaSource;
pub use memory::MemorySource;
pub use synthetic::SyntheticSource;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::{SourceConfig, SourceKind};
use crate::error::SourceError;

/// A single message read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Payload size used for batch byte limits.
    pub fn byte_size(&self) -> usize {
        self.key.as_ref().map_or(0, Bytes::len) + self.value.len()
    }
}

/// A consumer of one or more topic partitions.
#[async_trait]
pub trait RecordSource: Send {
    /// Fetch the next records, waiting at most `max_wait`.
    ///
    /// May return an empty vec on timeout. Must be cancel-safe: dropping the
    /// future leaves the cursor where it was.
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Record>, SourceError>;

    /// Partitions this source reads.
    fn assignment(&self) -> BTreeSet<i32>;

    /// Position the cursor of `partition` so the next record returned has
    /// an offset of at least `next_offset`.
    fn seek(&mut self, partition: i32, next_offset: i64);

    /// Whether a finite source has returned all of its records.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Build one source per partition group.
pub async fn from_config(config: &SourceConfig) -> Result<Vec<Box<dyn RecordSource>>, SourceError> {
    let assignments = config.assignments();
    let mut sources: Vec<Box<dyn RecordSource>> = Vec::with_capacity(assignments.len());

    match config.kind {
        SourceKind::Kafka => {
            let client = kafka::connect(&config.brokers).await?;
            for partitions in assignments {
                sources.push(Box::new(
                    KafkaSource::new(&client, config, &partitions).await?,
                ));
            }
        }
        SourceKind::Synthetic => {
            let groups = assignments.len() as u64;
            for (i, partitions) in assignments.into_iter().enumerate() {
                // Spread the message budget so the groups together produce exactly `message_count`.
                let share = config.synthetic.message_count.map(|total| {
                    total / groups + u64::from((i as u64) < total % groups)
                });
                let rate = config
                    .synthetic
                    .rate_per_sec
                    .map(|rate| (rate / groups).max(1));
                sources.push(Box::new(
                    SyntheticSource::new(partitions, config.max_poll_records)
                        .with_message_count(share)
                        .with_rate(rate)
                        .with_source_name(&config.synthetic.source_name),
                ));
            }
        }
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_byte_size_counts_key_and_value() {
        let record = Record {
            partition: 0,
            offset: 7,
            key: Some(Bytes::from_static(b"key")),
            value: Bytes::from_static(b"{\"a\":1}"),
            timestamp: Utc::now(),
        };
        assert_eq!(record.byte_size(), 10);

        let keyless = Record { key: None, ..record };
        assert_eq!(keyless.byte_size(), 7);
    }

    #[tokio::test]
    async fn test_synthetic_sources_split_message_count() {
        let yaml = r#"
topic: perf
kind: synthetic
partitions: [0, 1, 2]
partition_groups: 2
synthetic:
  message_count: 11
"#;
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        let mut sources = from_config(&config).await.unwrap();
        assert_eq!(sources.len(), 2);

        let mut total = 0;
        for source in sources.iter_mut() {
            while !source.is_exhausted() {
                total += source.poll(Duration::from_millis(10)).await.unwrap().len();
            }
        }
        assert_eq!(total, 11);
    }
}
