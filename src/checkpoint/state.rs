//! Persisted checkpoint document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Committed offsets of one topic.
///
/// Each offset is the last acknowledged offset of its partition; consumption
/// resumes one past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub schema_version: u32,
    pub topic: String,
    pub partitions: BTreeMap<i32, i64>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(topic: impl Into<String>, partitions: BTreeMap<i32, i64>) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            topic: topic.into(),
            partitions,
            updated_at: Utc::now(),
        }
    }

    /// Offset to resume from on `partition`, if it has a checkpoint.
    pub fn resume_offset(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).map(|offset| offset + 1)
    }
}
