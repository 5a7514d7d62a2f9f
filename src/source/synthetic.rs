//! Synthetic load generator.
//!
//! Produces JSON test messages of the shape
//! `{id, message, timestamp, source, priority}` spread round-robin over the
//! assigned partitions, optionally rate limited.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SourceError;

use super::{Record, RecordSource};

#[derive(Serialize)]
struct TestMessage<'a> {
    id: String,
    message: String,
    timestamp: String,
    source: &'a str,
    priority: u64,
}

pub struct SyntheticSource {
    partitions: Vec<i32>,
    next_offsets: BTreeMap<i32, i64>,
    max_records: usize,
    message_count: Option<u64>,
    rate_per_sec: Option<u64>,
    source_name: String,
    produced: u64,
    started: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(partitions: Vec<i32>, max_records: usize) -> Self {
        let next_offsets = partitions.iter().map(|p| (*p, 0)).collect();
        Self {
            partitions,
            next_offsets,
            max_records: max_records.max(1),
            message_count: None,
            rate_per_sec: None,
            source_name: "performance-test".to_string(),
            produced: 0,
            started: None,
        }
    }

    /// Stop after `count` messages. `None` generates forever.
    pub fn with_message_count(mut self, count: Option<u64>) -> Self {
        self.message_count = count;
        self
    }

    pub fn with_rate(mut self, per_sec: Option<u64>) -> Self {
        self.rate_per_sec = per_sec.filter(|r| *r > 0);
        self
    }

    pub fn with_source_name(mut self, name: &str) -> Self {
        self.source_name = name.to_string();
        self
    }

    /// Messages produced so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn generate(&mut self, i: u64) -> Record {
        let partition = self.partitions[(i % self.partitions.len() as u64) as usize];
        let offset = self.next_offsets.entry(partition).or_default();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let message = TestMessage {
            id: id.clone(),
            message: format!("Test message {i}"),
            timestamp: now.to_rfc3339(),
            source: &self.source_name,
            priority: i % 3,
        };
        // Serializing a struct of strings and integers cannot fail.
        let value = serde_json::to_vec(&message).unwrap_or_default();

        let record = Record {
            partition,
            offset: *offset,
            key: Some(Bytes::from(id)),
            value: Bytes::from(value),
            timestamp: now,
        };
        *offset += 1;
        record
    }
}

#[async_trait]
impl RecordSource for SyntheticSource {
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Record>, SourceError> {
        if self.partitions.is_empty() || self.is_exhausted() {
            return Ok(Vec::new());
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        let mut budget = self.max_records as u64;
        if let Some(limit) = self.message_count {
            budget = budget.min(limit - self.produced);
        }

        if let Some(rate) = self.rate_per_sec {
            let allowed = (started.elapsed().as_secs_f64() * rate as f64) as u64;
            let due = allowed.saturating_sub(self.produced);
            if due == 0 {
                let next_at = Duration::from_secs_f64((self.produced + 1) as f64 / rate as f64);
                tokio::time::sleep(next_at.saturating_sub(started.elapsed()).min(max_wait)).await;
                return Ok(Vec::new());
            }
            budget = budget.min(due);
        }

        let first = self.produced;
        let records = (first..first + budget).map(|i| self.generate(i)).collect();
        self.produced += budget;
        Ok(records)
    }

    fn assignment(&self) -> BTreeSet<i32> {
        self.partitions.iter().copied().collect()
    }

    fn seek(&mut self, partition: i32, next_offset: i64) {
        if let Some(offset) = self.next_offsets.get_mut(&partition) {
            *offset = next_offset;
        }
    }

    fn is_exhausted(&self) -> bool {
        self.message_count
            .is_some_and(|limit| self.produced >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generates_test_messages() {
        let mut source = SyntheticSource::new(vec![0, 1], 10).with_message_count(Some(4));
        let records = source.poll(Duration::ZERO).await.unwrap();

        assert_eq!(records.len(), 4);
        assert!(source.is_exhausted());
        assert_eq!(
            records.iter().map(|r| (r.partition, r.offset)).collect::<Vec<_>>(),
            vec![(0, 0), (1, 0), (0, 1), (1, 1)]
        );

        let value: serde_json::Value = serde_json::from_slice(&records[2].value).unwrap();
        assert_eq!(value["message"], "Test message 2");
        assert_eq!(value["source"], "performance-test");
        assert_eq!(value["priority"], 2);
        assert_eq!(
            records[2].key.as_deref(),
            Some(value["id"].as_str().unwrap().as_bytes())
        );
    }

    #[tokio::test]
    async fn test_respects_max_records_per_poll() {
        let mut source = SyntheticSource::new(vec![0], 3).with_message_count(Some(7));

        let sizes = [
            source.poll(Duration::ZERO).await.unwrap().len(),
            source.poll(Duration::ZERO).await.unwrap().len(),
            source.poll(Duration::ZERO).await.unwrap().len(),
        ];
        assert_eq!(sizes, [3, 3, 1]);
        assert!(source.poll(Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spreads_messages_over_time() {
        let mut source = SyntheticSource::new(vec![0], 1000)
            .with_message_count(Some(100))
            .with_rate(Some(10));

        // Nothing is due at t=0.
        assert!(source.poll(Duration::from_millis(50)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let records = source.poll(Duration::ZERO).await.unwrap();
        assert!((9..=11).contains(&records.len()));
    }

    #[tokio::test]
    async fn test_seek_continues_offsets() {
        let mut source = SyntheticSource::new(vec![3], 2).with_message_count(Some(2));
        source.seek(3, 41);

        let offsets: Vec<i64> = source
            .poll(Duration::ZERO)
            .await
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![41, 42]);
    }
}
