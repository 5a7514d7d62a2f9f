//! Offset tracking for at-least-once delivery.
//!
//! Every batch is registered with the [`OffsetCommitter`] when it is formed.
//! A partition's committed offset only moves over the contiguous prefix of
//! its registered batches that have been resolved (acknowledged, or
//! dead-lettered under the skip policy), so a batch that completes early
//! never commits past one that is still in flight. Commits merge with `max`,
//! which makes replayed acknowledgements harmless.

pub mod state;
mod store;

pub use state::{CHECKPOINT_SCHEMA_VERSION, CheckpointState};
pub use store::{CheckpointStore, ObjectCheckpointStore};

use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::emit;
use crate::error::{CheckpointError, UnsupportedSchemaSnafu};
use crate::metrics::events::{CheckpointFailed, CheckpointPersisted, OffsetCommitted};
use crate::sink::Ack;

#[derive(Debug, Clone, Copy)]
struct PendingBatch {
    last_offset: i64,
    resolved: bool,
}

#[derive(Debug, Default)]
struct PartitionCommits {
    committed: Option<i64>,
    /// Registered batches by id; ids grow in formation order.
    pending: BTreeMap<u64, PendingBatch>,
}

impl PartitionCommits {
    fn merge(&mut self, offset: i64) -> bool {
        match self.committed {
            Some(current) if current >= offset => false,
            _ => {
                self.committed = Some(offset);
                true
            }
        }
    }

    /// Commit every resolved batch at the head of the queue.
    fn advance(&mut self) -> bool {
        let mut moved = false;
        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().resolved {
                break;
            }
            let batch = entry.remove();
            moved |= self.merge(batch.last_offset);
        }
        moved
    }
}

#[derive(Debug, Default)]
struct CommitState {
    partitions: BTreeMap<i32, PartitionCommits>,
    /// Partitions touched by each registered, unresolved batch.
    batches: HashMap<u64, Vec<i32>>,
    generation: u64,
    persisted_generation: u64,
}

impl CommitState {
    /// Resolve `batch_id` on `partition`, returning the new commit if it moved.
    fn resolve(&mut self, partition: i32, batch_id: u64, offset: i64) -> Option<i64> {
        let commits = self.partitions.entry(partition).or_default();
        let outstanding = !commits.pending.is_empty();

        let moved = match commits.pending.get_mut(&batch_id) {
            Some(batch) => {
                batch.resolved = true;
                commits.advance()
            }
            // Unknown batch: a replay, or an ack from outside this run. It is
            // only safe to merge when nothing is outstanding on the partition.
            None if !outstanding => commits.merge(offset),
            None => {
                debug!(
                    "[commit] Ignoring ack for unregistered batch {} on partition {}",
                    batch_id, partition
                );
                false
            }
        };

        if moved {
            self.generation += 1;
        }
        moved.then_some(commits.committed).flatten()
    }
}

/// Tracks pending batches and committed offsets for one topic.
pub struct OffsetCommitter {
    topic: String,
    store: Arc<dyn CheckpointStore>,
    state: Mutex<CommitState>,
}

impl OffsetCommitter {
    pub fn new(topic: impl Into<String>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            topic: topic.into(),
            store,
            state: Mutex::new(CommitState::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Load persisted offsets, returning the committed offset per partition.
    pub async fn restore(&self) -> Result<BTreeMap<i32, i64>, CheckpointError> {
        let Some(checkpoint) = self.store.load(&self.topic).await? else {
            info!("[commit] No checkpoint for topic {}, starting fresh", self.topic);
            return Ok(BTreeMap::new());
        };
        ensure!(
            checkpoint.schema_version == CHECKPOINT_SCHEMA_VERSION,
            UnsupportedSchemaSnafu {
                topic: self.topic.as_str(),
                found: checkpoint.schema_version,
                expected: CHECKPOINT_SCHEMA_VERSION,
            }
        );

        let mut state = self.state.lock().await;
        for (partition, offset) in &checkpoint.partitions {
            state
                .partitions
                .entry(*partition)
                .or_default()
                .merge(*offset);
        }
        info!(
            "[commit] Restored checkpoint for topic {}: {:?}",
            self.topic, checkpoint.partitions
        );
        Ok(checkpoint.partitions)
    }

    /// Record a newly formed batch. Must be called before it is dispatched.
    pub async fn register(&self, batch: &Batch) {
        let offsets = batch.offsets();
        let mut state = self.state.lock().await;
        for (partition, last_offset) in &offsets {
            state
                .partitions
                .entry(*partition)
                .or_default()
                .pending
                .insert(
                    batch.id,
                    PendingBatch {
                        last_offset: *last_offset,
                        resolved: false,
                    },
                );
        }
        state.batches.insert(batch.id, offsets.into_keys().collect());
    }

    /// Resolve an acknowledged batch. Returns the offsets that advanced.
    pub async fn on_ack(&self, ack: &Ack) -> Vec<(i32, i64)> {
        let mut state = self.state.lock().await;
        state.batches.remove(&ack.batch_id);

        let mut advanced = Vec::new();
        for (partition, offset) in &ack.offsets {
            if let Some(committed) = state.resolve(*partition, ack.batch_id, *offset) {
                emit!(OffsetCommitted {
                    partition: *partition,
                    offset: committed,
                });
                advanced.push((*partition, committed));
            }
        }
        advanced
    }

    /// Resolve a batch whose records were dead-lettered instead of inserted.
    pub async fn on_failed(&self, batch_id: u64) -> Vec<(i32, i64)> {
        let mut state = self.state.lock().await;
        let Some(partitions) = state.batches.remove(&batch_id) else {
            return Vec::new();
        };

        let mut advanced = Vec::new();
        for partition in partitions {
            let last_offset = state
                .partitions
                .get(&partition)
                .and_then(|p| p.pending.get(&batch_id))
                .map(|b| b.last_offset);
            if let Some(offset) = last_offset
                && let Some(committed) = state.resolve(partition, batch_id, offset)
            {
                emit!(OffsetCommitted {
                    partition,
                    offset: committed,
                });
                advanced.push((partition, committed));
            }
        }
        advanced
    }

    pub async fn committed(&self, partition: i32) -> Option<i64> {
        let state = self.state.lock().await;
        state.partitions.get(&partition).and_then(|p| p.committed)
    }

    /// Committed offsets of the given partitions that have one.
    pub async fn checkpoints_on(
        &self,
        partitions: impl IntoIterator<Item = i32>,
    ) -> HashMap<i32, i64> {
        let state = self.state.lock().await;
        partitions
            .into_iter()
            .filter_map(|p| {
                state
                    .partitions
                    .get(&p)
                    .and_then(|c| c.committed)
                    .map(|offset| (p, offset))
            })
            .collect()
    }

    /// Batches registered but not yet resolved.
    pub async fn pending_batches(&self) -> usize {
        self.state.lock().await.batches.len()
    }

    /// Write the committed offsets if they changed since the last write.
    ///
    /// Returns whether a document was written. A failure leaves the offsets
    /// marked dirty so the next call retries.
    pub async fn persist(&self) -> Result<bool, CheckpointError> {
        let (generation, partitions) = {
            let state = self.state.lock().await;
            if state.generation == state.persisted_generation {
                return Ok(false);
            }
            let partitions: BTreeMap<i32, i64> = state
                .partitions
                .iter()
                .filter_map(|(p, c)| c.committed.map(|offset| (*p, offset)))
                .collect();
            (state.generation, partitions)
        };

        let start = Instant::now();
        let checkpoint = CheckpointState::new(self.topic.clone(), partitions);
        if let Err(e) = self.store.save(&checkpoint).await {
            emit!(CheckpointFailed);
            warn!("[commit] Failed to persist checkpoint for {}: {}", self.topic, e);
            return Err(e);
        }
        emit!(CheckpointPersisted {
            duration: start.elapsed(),
        });

        let mut state = self.state.lock().await;
        state.persisted_generation = state.persisted_generation.max(generation);
        debug!(
            "[commit] Persisted checkpoint for {}: {:?}",
            self.topic, checkpoint.partitions
        );
        Ok(true)
    }
}
