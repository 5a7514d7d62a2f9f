//! Batch formation.
//!
//! The [`Batcher`] accumulates records until one of its limits is hit:
//! bytes first, then record count, then age. Age is only evaluated by
//! [`Batcher::tick`], which the poll worker drives from an interval.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RunOptions;
use crate::emit;
use crate::metrics::events::{BatchFormed, FlushReason};
use crate::source::Record;

/// Thresholds that close a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_bytes: usize,
    pub max_count: usize,
    pub max_age: Duration,
}

impl From<&RunOptions> for BatchLimits {
    fn from(options: &RunOptions) -> Self {
        Self {
            max_bytes: options.batch_max_bytes,
            max_count: options.batch_max_count,
            max_age: options.batch_max_age(),
        }
    }
}

/// A closed, non-empty group of records on its way to the sink.
#[derive(Debug)]
pub struct Batch {
    pub id: u64,
    pub records: Vec<Record>,
    /// When the first record entered the batch.
    pub created_at: Instant,
    pub byte_size: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest offset per partition contained in this batch.
    pub fn offsets(&self) -> BTreeMap<i32, i64> {
        let mut offsets = BTreeMap::new();
        for record in &self.records {
            offsets
                .entry(record.partition)
                .and_modify(|o: &mut i64| *o = (*o).max(record.offset))
                .or_insert(record.offset);
        }
        offsets
    }

    /// Lowest and highest offset per partition.
    pub fn offset_ranges(&self) -> BTreeMap<i32, (i64, i64)> {
        let mut ranges = BTreeMap::new();
        for record in &self.records {
            ranges
                .entry(record.partition)
                .and_modify(|(lo, hi): &mut (i64, i64)| {
                    *lo = (*lo).min(record.offset);
                    *hi = (*hi).max(record.offset);
                })
                .or_insert((record.offset, record.offset));
        }
        ranges
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            id: self.id,
            records: self.len(),
            offset_ranges: self.offset_ranges(),
        }
    }
}

/// What is left to know about a batch once its records moved to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub id: u64,
    pub records: usize,
    pub offset_ranges: BTreeMap<i32, (i64, i64)>,
}

/// Shared, monotonically increasing batch id allocator.
#[derive(Debug, Clone, Default)]
pub struct BatchIds(Arc<AtomicU64>);

impl BatchIds {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Accumulates records into batches for a single poll worker.
///
/// Records are kept in arrival order, so per-partition order holds inside
/// and across the batches it emits.
#[derive(Debug)]
pub struct Batcher {
    limits: BatchLimits,
    ids: BatchIds,
    buffer: Vec<Record>,
    buffer_bytes: usize,
    first_at: Option<Instant>,
    /// Closed batches not yet handed out; holds at most one in practice.
    ready: VecDeque<Batch>,
}

impl Batcher {
    pub fn new(limits: BatchLimits) -> Self {
        Self::with_ids(limits, BatchIds::default())
    }

    pub fn with_ids(limits: BatchLimits, ids: BatchIds) -> Self {
        Self {
            limits,
            ids,
            buffer: Vec::new(),
            buffer_bytes: 0,
            first_at: None,
            ready: VecDeque::new(),
        }
    }

    /// Add a record, returning a batch if one closed.
    pub fn add(&mut self, record: Record) -> Option<Batch> {
        let size = record.byte_size();

        if !self.buffer.is_empty() && self.buffer_bytes + size > self.limits.max_bytes {
            self.close(FlushReason::Bytes);
        }

        self.first_at.get_or_insert_with(Instant::now);
        self.buffer.push(record);
        self.buffer_bytes += size;

        if self.buffer_bytes >= self.limits.max_bytes {
            self.close(FlushReason::Bytes);
        } else if self.buffer.len() >= self.limits.max_count {
            self.close(FlushReason::Count);
        }

        self.ready.pop_front()
    }

    /// Close the batch if its oldest record has waited at least `max_age`.
    pub fn tick(&mut self, now: Instant) -> Option<Batch> {
        if self.ready.is_empty()
            && self
                .first_at
                .is_some_and(|first| now.saturating_duration_since(first) >= self.limits.max_age)
        {
            self.close(FlushReason::Age);
        }
        self.ready.pop_front()
    }

    /// When [`tick`](Self::tick) next has a batch to hand out: the moment the
    /// open batch reaches `max_age`, or right away if a closed batch is
    /// waiting. `None` while nothing is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        match self.ready.front() {
            Some(batch) => Some(batch.created_at),
            None => self.first_at.map(|first| first + self.limits.max_age),
        }
    }

    /// Close whatever is buffered. Call repeatedly until `None` to drain.
    pub fn flush_now(&mut self) -> Option<Batch> {
        if self.ready.is_empty() {
            self.close(FlushReason::Drain);
        }
        self.ready.pop_front()
    }

    /// Number of records waiting in the open batch.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn close(&mut self, reason: FlushReason) {
        let Some(created_at) = self.first_at.take() else {
            return;
        };
        let batch = Batch {
            id: self.ids.next(),
            records: std::mem::take(&mut self.buffer),
            created_at,
            byte_size: std::mem::take(&mut self.buffer_bytes),
        };
        emit!(BatchFormed {
            reason,
            records: batch.len(),
            bytes: batch.byte_size,
        });
        self.ready.push_back(batch);
    }
}
