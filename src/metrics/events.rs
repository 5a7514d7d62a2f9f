//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which records the
//! corresponding Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Source events
// ============================================================================

/// Event emitted when a poll returns records.
pub struct RecordsPolled {
    pub count: u64,
    pub bytes: u64,
}

impl InternalEvent for RecordsPolled {
    fn emit(self) {
        trace!(count = self.count, bytes = self.bytes, "Records polled");
        counter!("flurry_records_polled_total").increment(self.count);
        counter!("flurry_bytes_polled_total").increment(self.bytes);
    }
}

/// Event emitted when a poll fails and will be retried.
pub struct SourceUnavailable;

impl InternalEvent for SourceUnavailable {
    fn emit(self) {
        trace!("Source unavailable");
        counter!("flurry_source_errors_total").increment(1);
    }
}

// ============================================================================
// Batching events
// ============================================================================

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Bytes,
    Count,
    Age,
    Drain,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Bytes => "bytes",
            FlushReason::Count => "count",
            FlushReason::Age => "age",
            FlushReason::Drain => "drain",
        }
    }
}

/// Event emitted when the batcher closes a batch.
pub struct BatchFormed {
    pub reason: FlushReason,
    pub records: usize,
    pub bytes: usize,
}

impl InternalEvent for BatchFormed {
    fn emit(self) {
        trace!(
            reason = self.reason.as_str(),
            records = self.records,
            bytes = self.bytes,
            "Batch formed"
        );
        counter!("flurry_batches_formed_total", "reason" => self.reason.as_str()).increment(1);
        histogram!("flurry_batch_records").record(self.records as f64);
        histogram!("flurry_batch_bytes").record(self.bytes as f64);
    }
}

/// Event emitted when the number of batches queued for dispatch changes.
pub struct BufferedBatches {
    pub count: usize,
}

impl InternalEvent for BufferedBatches {
    fn emit(self) {
        trace!(count = self.count, "Buffered batches");
        gauge!("flurry_buffered_batches").set(self.count as f64);
    }
}

/// Event emitted when the number of admitted, unfinished batches changes.
pub struct InFlightBatches {
    pub count: usize,
}

impl InternalEvent for InFlightBatches {
    fn emit(self) {
        trace!(count = self.count, "In-flight batches");
        gauge!("flurry_in_flight_batches").set(self.count as f64);
    }
}

// ============================================================================
// Sink events
// ============================================================================

/// Event emitted before the sink retries an insert.
pub struct SinkRetry;

impl InternalEvent for SinkRetry {
    fn emit(self) {
        trace!("Sink retry");
        counter!("flurry_sink_retries_total").increment(1);
    }
}

/// Event emitted when the warehouse rejects rows for good.
pub struct RowsRejected {
    pub count: u64,
}

impl InternalEvent for RowsRejected {
    fn emit(self) {
        trace!(count = self.count, "Rows rejected");
        counter!("flurry_rows_rejected_total").increment(self.count);
    }
}

/// Event emitted when a batch is acknowledged by the warehouse.
pub struct BatchAcked {
    pub records: u64,
    pub latency: Duration,
}

impl InternalEvent for BatchAcked {
    fn emit(self) {
        trace!(
            records = self.records,
            latency_ms = self.latency.as_millis(),
            "Batch acked"
        );
        counter!("flurry_batches_acked_total").increment(1);
        counter!("flurry_records_ingested_total").increment(self.records);
        histogram!("flurry_batch_latency_seconds").record(self.latency.as_secs_f64());
    }
}

/// Outcome of a batch that was not acknowledged.
#[derive(Debug, Clone, Copy)]
pub enum BatchOutcome {
    Failed,
    Abandoned,
}

impl BatchOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            BatchOutcome::Failed => "failed",
            BatchOutcome::Abandoned => "abandoned",
        }
    }
}

/// Event emitted when a batch fails permanently or is abandoned on drain.
pub struct BatchLost {
    pub outcome: BatchOutcome,
    pub records: u64,
}

impl InternalEvent for BatchLost {
    fn emit(self) {
        trace!(
            outcome = self.outcome.as_str(),
            records = self.records,
            "Batch not acknowledged"
        );
        counter!("flurry_batches_lost_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

// ============================================================================
// Checkpoint events
// ============================================================================

/// Event emitted when a partition's committed offset advances.
pub struct OffsetCommitted {
    pub partition: i32,
    pub offset: i64,
}

impl InternalEvent for OffsetCommitted {
    fn emit(self) {
        trace!(
            partition = self.partition,
            offset = self.offset,
            "Offset committed"
        );
        gauge!("flurry_committed_offset", "partition" => self.partition.to_string())
            .set(self.offset as f64);
    }
}

/// Event emitted after a checkpoint document is written.
pub struct CheckpointPersisted {
    pub duration: Duration,
}

impl InternalEvent for CheckpointPersisted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Checkpoint persisted"
        );
        counter!("flurry_checkpoint_commits_total", "status" => "success").increment(1);
        histogram!("flurry_checkpoint_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when writing a checkpoint document fails.
pub struct CheckpointFailed;

impl InternalEvent for CheckpointFailed {
    fn emit(self) {
        trace!("Checkpoint failed");
        counter!("flurry_checkpoint_commits_total", "status" => "error").increment(1);
    }
}

/// Event emitted with the difference between read and committed offsets.
pub struct CommitLag {
    pub partition: i32,
    pub lag: i64,
}

impl InternalEvent for CommitLag {
    fn emit(self) {
        trace!(partition = self.partition, lag = self.lag, "Commit lag");
        gauge!("flurry_commit_lag", "partition" => self.partition.to_string())
            .set(self.lag as f64);
    }
}

// ============================================================================
// Storage & DLQ events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "flurry_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "flurry_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when dead letters are flushed to storage.
pub struct DeadLettersWritten {
    pub count: u64,
}

impl InternalEvent for DeadLettersWritten {
    fn emit(self) {
        trace!(count = self.count, "Dead letters written");
        counter!("flurry_dead_letters_total").increment(self.count);
    }
}

// ============================================================================
// Lifecycle events
// ============================================================================

/// Event emitted when a run changes state.
pub struct RunStateChanged {
    pub state: &'static str,
}

impl InternalEvent for RunStateChanged {
    fn emit(self) {
        trace!(state = self.state, "Run state changed");
        counter!("flurry_run_transitions_total", "state" => self.state).increment(1);
    }
}
