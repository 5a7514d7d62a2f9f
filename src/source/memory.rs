//! In-memory source with scripted unavailability.
//!
//! Used for replays and to drive the pipeline deterministically in tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::SourceError;

use super::{Record, RecordSource};

#[derive(Debug, Default)]
struct MemoryPartition {
    records: Vec<Record>,
    /// Index of the next record to return.
    cursor: usize,
}

impl MemoryPartition {
    fn remaining(&self) -> usize {
        self.records.len() - self.cursor
    }
}

/// A finite source over records held in memory.
#[derive(Debug)]
pub struct MemorySource {
    partitions: BTreeMap<i32, MemoryPartition>,
    max_records: usize,
    /// Number of upcoming polls that fail with `Unavailable`.
    failing_polls: usize,
    /// Partition the next poll starts from, rotated for fairness.
    rotation: usize,
}

impl MemorySource {
    pub fn new(max_records: usize) -> Self {
        Self {
            partitions: BTreeMap::new(),
            max_records: max_records.max(1),
            failing_polls: 0,
            rotation: 0,
        }
    }

    /// Add a partition holding `values` at offsets `0..values.len()`.
    pub fn with_partition<I, V>(mut self, partition: i32, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        for value in values {
            self.push(partition, None, value);
        }
        self
    }

    /// Append a record to the end of a partition.
    pub fn push(&mut self, partition: i32, key: Option<Bytes>, value: impl Into<Bytes>) {
        let entry = self.partitions.entry(partition).or_default();
        let offset = entry.records.last().map_or(0, |r| r.offset + 1);
        entry.records.push(Record {
            partition,
            offset,
            key,
            value: value.into(),
            timestamp: Utc::now(),
        });
    }

    /// Make the next `polls` calls to `poll` fail as if the broker were down.
    pub fn fail_next_polls(&mut self, polls: usize) {
        self.failing_polls = polls;
    }

    /// Records not yet returned.
    pub fn remaining(&self) -> usize {
        self.partitions.values().map(MemoryPartition::remaining).sum()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn poll(&mut self, _max_wait: Duration) -> Result<Vec<Record>, SourceError> {
        if self.failing_polls > 0 {
            self.failing_polls -= 1;
            return Err(SourceError::Unavailable {
                message: "scripted outage".to_string(),
            });
        }

        let count = self.partitions.len();
        let mut records = Vec::new();
        if count == 0 {
            return Ok(records);
        }

        let share = self.max_records.div_ceil(count);
        let start = self.rotation % count;
        self.rotation = self.rotation.wrapping_add(1);

        let keys: Vec<i32> = self.partitions.keys().copied().collect();
        for i in 0..count {
            let Some(partition) = self.partitions.get_mut(&keys[(start + i) % count]) else {
                continue;
            };
            let budget = share.min(self.max_records - records.len());
            let end = (partition.cursor + budget).min(partition.records.len());
            records.extend_from_slice(&partition.records[partition.cursor..end]);
            partition.cursor = end;
        }

        Ok(records)
    }

    fn assignment(&self) -> BTreeSet<i32> {
        self.partitions.keys().copied().collect()
    }

    fn seek(&mut self, partition: i32, next_offset: i64) {
        if let Some(entry) = self.partitions.get_mut(&partition) {
            entry.cursor = entry.records.partition_point(|r| r.offset < next_offset);
        }
    }

    fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
