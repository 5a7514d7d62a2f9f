//! Dead letter records and failure statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchSummary;
use crate::sink::RejectedRow;

/// Why records ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// The warehouse refused a single row for good.
    RejectedRow,
    /// A whole batch failed permanently and was skipped.
    FailedBatch,
    /// A batch was still in flight or queued when the drain deadline passed.
    AbandonedBatch,
}

impl DeadLetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterKind::RejectedRow => "rejected_row",
            DeadLetterKind::FailedBatch => "failed_batch",
            DeadLetterKind::AbandonedBatch => "abandoned_batch",
        }
    }
}

/// One contiguous offset range of a partition that was not ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub kind: DeadLetterKind,
    pub topic: String,
    pub batch_id: u64,
    pub partition: i32,
    pub first_offset: i64,
    pub last_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn rejected_row(topic: &str, batch_id: u64, row: &RejectedRow) -> Self {
        Self {
            kind: DeadLetterKind::RejectedRow,
            topic: topic.to_string(),
            batch_id,
            partition: row.partition,
            first_offset: row.offset,
            last_offset: row.offset,
            insert_id: Some(row.insert_id.clone()),
            error: format!("{}: {}", row.reason, row.message),
            timestamp: Utc::now(),
        }
    }

    /// One letter per partition covered by the batch.
    pub fn for_batch(
        kind: DeadLetterKind,
        topic: &str,
        batch: &BatchSummary,
        error: &str,
    ) -> Vec<Self> {
        let timestamp = Utc::now();
        batch
            .offset_ranges
            .iter()
            .map(|(partition, (first, last))| Self {
                kind,
                topic: topic.to_string(),
                batch_id: batch.id,
                partition: *partition,
                first_offset: *first,
                last_offset: *last,
                insert_id: None,
                error: error.to_string(),
                timestamp,
            })
            .collect()
    }
}

/// Dead letters recorded so far, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureStats {
    pub rejected_rows: usize,
    pub failed_batches: usize,
    pub abandoned_batches: usize,
}

impl FailureStats {
    pub fn increment(&mut self, kind: DeadLetterKind) {
        match kind {
            DeadLetterKind::RejectedRow => self.rejected_rows += 1,
            DeadLetterKind::FailedBatch => self.failed_batches += 1,
            DeadLetterKind::AbandonedBatch => self.abandoned_batches += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.rejected_rows + self.failed_batches + self.abandoned_batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_batch_letters_cover_each_partition() {
        let summary = BatchSummary {
            id: 7,
            records: 30,
            offset_ranges: BTreeMap::from([(0, (10, 19)), (2, (40, 59))]),
        };

        let letters =
            DeadLetter::for_batch(DeadLetterKind::FailedBatch, "events", &summary, "boom");
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[1].partition, 2);
        assert_eq!((letters[1].first_offset, letters[1].last_offset), (40, 59));
        assert!(letters.iter().all(|l| l.batch_id == 7 && l.insert_id.is_none()));
    }

    #[test]
    fn test_dead_letter_serialization() {
        let row = RejectedRow {
            partition: 1,
            offset: 5,
            insert_id: "events-1-5".to_string(),
            reason: "invalid".to_string(),
            message: "no such field: foo".to_string(),
        };
        let json = serde_json::to_string(&DeadLetter::rejected_row("events", 3, &row)).unwrap();

        assert!(json.contains(r#""kind":"rejected_row""#));
        assert!(json.contains(r#""insert_id":"events-1-5""#));
        assert!(json.contains("invalid: no such field: foo"));

        let parsed: DeadLetter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.first_offset, 5);
    }

    #[test]
    fn test_failure_stats() {
        let mut stats = FailureStats::default();
        stats.increment(DeadLetterKind::RejectedRow);
        stats.increment(DeadLetterKind::RejectedRow);
        stats.increment(DeadLetterKind::AbandonedBatch);

        assert_eq!(stats.rejected_rows, 2);
        assert_eq!(stats.abandoned_batches, 1);
        assert_eq!(stats.total(), 3);
    }
}
