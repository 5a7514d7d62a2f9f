//! Warehouse sink.
//!
//! The [`Sink`] turns a [`Batch`] into streaming inserts against a
//! [`Warehouse`], retrying whole-call transient failures and rows with
//! retryable per-row errors under an exponential backoff. Rows rejected for
//! good are returned in the [`Ack`] so they can be dead-lettered.

mod auth;
mod backoff;
mod bigquery;
mod mock;
mod rows;

pub use auth::{GoogleToken, StaticToken, TokenSource, token_source};
pub use backoff::{Backoff, BackoffPolicy, FixedJitter, Jitter, RandomJitter};
pub use bigquery::BigQueryWarehouse;
pub use mock::{MockFault, MockWarehouse};
pub use rows::{RAW_PAYLOAD_COLUMN, WarehouseRow, to_row};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::{SinkConfig, SinkKind};
use crate::emit;
use crate::error::{ConfigError, SinkError, WarehouseError};
use crate::metrics::events::{RowsRejected, SinkRetry};

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset, self.table)
    }
}

impl From<&SinkConfig> for TableRef {
    fn from(config: &SinkConfig) -> Self {
        Self {
            project_id: config.project_id.clone(),
            dataset: config.dataset.clone(),
            table: config.table.clone(),
        }
    }
}

/// An error attached to one row of an insert request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Index into the rows of the request.
    pub index: usize,
    pub reason: String,
    pub message: String,
    pub retryable: bool,
}

impl RowError {
    pub fn new(index: usize, reason: impl Into<String>, message: impl Into<String>) -> Self {
        let reason = reason.into();
        let message = message.into();
        let retryable = is_retryable(&reason, &message);
        Self {
            index,
            reason,
            message,
            retryable,
        }
    }
}

/// Whether a per-row error reason is worth another attempt.
///
/// `stopped` marks rows that were valid but not inserted because another
/// row in the same request was invalid.
pub fn is_retryable(reason: &str, message: &str) -> bool {
    const RETRYABLE_REASONS: [&str; 5] = [
        "backendError",
        "rateLimitExceeded",
        "internalError",
        "timeout",
        "stopped",
    ];
    let message = message.to_ascii_lowercase();
    RETRYABLE_REASONS.contains(&reason)
        || message.contains("timeout")
        || message.contains("temporarily unavailable")
}

/// Outcome of an insert call that reached the warehouse.
#[derive(Debug, Clone, Default)]
pub struct InsertResponse {
    pub row_errors: Vec<RowError>,
}

/// The append-only primitive of a columnar warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[WarehouseRow],
    ) -> Result<InsertResponse, WarehouseError>;
}

/// A row the warehouse refused for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub partition: i32,
    pub offset: i64,
    pub insert_id: String,
    pub reason: String,
    pub message: String,
}

/// Acknowledgement that a batch has been handled by the warehouse.
///
/// Every record of the batch is either accepted or listed in `rejected`.
#[derive(Debug, Clone)]
pub struct Ack {
    pub batch_id: u64,
    /// Highest offset per partition covered by the batch.
    pub offsets: BTreeMap<i32, i64>,
    pub accepted: usize,
    pub rejected: Vec<RejectedRow>,
    /// Insert calls made, including the first.
    pub attempts: u32,
}

/// Retry settings for the sink.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl From<&SinkConfig> for RetryPolicy {
    fn from(config: &SinkConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            backoff: BackoffPolicy::new(
                Duration::from_millis(config.initial_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
        }
    }
}

/// Build the warehouse client selected by the config.
pub fn warehouse_from_config(config: &SinkConfig) -> Result<Arc<dyn Warehouse>, ConfigError> {
    Ok(match config.kind {
        SinkKind::BigQuery => Arc::new(BigQueryWarehouse::new(&config.bigquery)?),
        SinkKind::Mock => Arc::new(
            MockWarehouse::new().with_latency(Duration::from_millis(config.mock.latency_ms)),
        ),
    })
}

pub struct Sink {
    warehouse: Arc<dyn Warehouse>,
    table: TableRef,
    topic: String,
    retry: RetryPolicy,
    jitter: Arc<dyn Jitter>,
}

impl Sink {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        table: TableRef,
        topic: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            warehouse,
            table,
            topic: topic.into(),
            retry,
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Replace the jitter source of the retry schedule.
    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Deliver a batch to the warehouse.
    ///
    /// Only rows that failed with a retryable error are resent. Exhausting
    /// the attempts, or a permanent whole-call failure, fails the batch.
    pub async fn append(&self, batch: Batch) -> Result<Ack, SinkError> {
        let batch_id = batch.id;
        let offsets = batch.offsets();
        let inserted_at = Utc::now();
        let mut pending: Vec<WarehouseRow> = batch
            .records
            .iter()
            .map(|record| to_row(&self.topic, record, inserted_at))
            .collect();
        let total = pending.len();
        drop(batch);

        let mut rejected = Vec::new();
        let mut backoff = Backoff::with_jitter(self.retry.backoff, self.jitter.clone());
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let reason = match self.attempt(batch_id, attempt, &pending).await {
                Ok(response) => {
                    let retry = split_row_errors(&mut pending, response, &mut rejected);
                    if retry.is_empty() {
                        break;
                    }
                    pending = retry;
                    format!("{} rows failed with retryable errors", pending.len())
                }
                Err(SinkError::Transient { source, .. }) => source.to_string(),
                Err(e) => return Err(e),
            };

            if attempt >= self.retry.max_attempts {
                return Err(SinkError::Permanent {
                    batch_id,
                    attempts: attempt,
                    reason: format!("retries exhausted: {reason}"),
                });
            }

            let delay = backoff.next_delay();
            emit!(SinkRetry);
            warn!(
                "[sink] Batch {} attempt {} failed ({}), retrying in {:?}",
                batch_id, attempt, reason, delay
            );
            tokio::time::sleep(delay).await;
        }

        if let Some(first) = rejected.first() {
            emit!(RowsRejected {
                count: rejected.len() as u64
            });
            warn!(
                "[sink] Batch {}: {} of {} rows rejected by {} (first: offset {}: {} ({}))",
                batch_id,
                rejected.len(),
                total,
                self.table,
                first.offset,
                first.message,
                first.reason
            );
        }
        debug!(
            "[sink] Batch {} appended to {}: {} accepted, {} rejected, {} attempts",
            batch_id,
            self.table,
            total - rejected.len(),
            rejected.len(),
            attempt
        );

        Ok(Ack {
            batch_id,
            offsets,
            accepted: total - rejected.len(),
            rejected,
            attempts: attempt,
        })
    }

    async fn attempt(
        &self,
        batch_id: u64,
        attempt: u32,
        rows: &[WarehouseRow],
    ) -> Result<InsertResponse, SinkError> {
        match self.warehouse.insert_rows(&self.table, rows).await {
            Ok(response) => Ok(response),
            Err(source) if source.is_transient() => Err(SinkError::Transient {
                batch_id,
                attempt,
                source,
            }),
            Err(source) => Err(SinkError::Permanent {
                batch_id,
                attempts: attempt,
                reason: source.to_string(),
            }),
        }
    }
}

/// Move rows with permanent errors into `rejected` and return the rows to retry.
///
/// A row with several errors is retried only if every error is retryable.
fn split_row_errors(
    pending: &mut Vec<WarehouseRow>,
    response: InsertResponse,
    rejected: &mut Vec<RejectedRow>,
) -> Vec<WarehouseRow> {
    let mut by_row: BTreeMap<usize, Vec<RowError>> = BTreeMap::new();
    for error in response.row_errors {
        if error.index < pending.len() {
            by_row.entry(error.index).or_default().push(error);
        }
    }

    let mut retry = Vec::new();
    for (index, errors) in by_row {
        let row = &pending[index];
        if errors.iter().all(|e| e.retryable) {
            retry.push(row.clone());
            continue;
        }
        let error = errors.into_iter().find(|e| !e.retryable).unwrap_or_else(|| {
            RowError::new(index, "invalid", "row rejected by warehouse")
        });
        debug!(
            "[sink] Row {} rejected: {} ({})",
            row.insert_id, error.message, error.reason
        );
        rejected.push(RejectedRow {
            partition: row.partition,
            offset: row.offset,
            insert_id: row.insert_id.clone(),
            reason: error.reason,
            message: error.message,
        });
    }
    pending.clear();
    retry
}
