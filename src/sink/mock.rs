//! In-memory warehouse.
//!
//! Counts rows and calls instead of talking to a real warehouse, with
//! optional per-call latency and a queue of scripted faults consumed one
//! per call.

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::error::WarehouseError;

use super::{InsertResponse, RowError, TableRef, Warehouse, WarehouseRow};

/// Behaviour of a single insert call.
#[derive(Debug, Clone)]
pub enum MockFault {
    /// Fail the whole call with a retryable error.
    Transient,
    /// Fail the whole call with a non-retryable error.
    Permanent,
    /// Accept every row except the listed ones.
    RowErrors(Vec<RowError>),
    /// Wait before succeeding.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct MockState {
    rows: Vec<WarehouseRow>,
    call_sizes: Vec<usize>,
    faults: VecDeque<MockFault>,
}

#[derive(Debug, Default)]
pub struct MockWarehouse {
    state: Mutex<MockState>,
    latency: Duration,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a fault for the next call that has none.
    pub fn push_fault(&self, fault: MockFault) {
        self.lock().faults.push_back(fault);
    }

    /// Rows accepted so far, replays included.
    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    /// Rows accepted so far, counting each insert id once.
    pub fn unique_row_count(&self) -> usize {
        self.lock()
            .rows
            .iter()
            .map(|r| r.insert_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn call_count(&self) -> usize {
        self.lock().call_sizes.len()
    }

    /// Number of rows sent in each call, in call order.
    pub fn call_sizes(&self) -> Vec<usize> {
        self.lock().call_sizes.clone()
    }

    pub fn rows(&self) -> Vec<WarehouseRow> {
        self.lock().rows.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Warehouse for MockWarehouse {
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[WarehouseRow],
    ) -> Result<InsertResponse, WarehouseError> {
        let fault = {
            let mut state = self.lock();
            state.call_sizes.push(rows.len());
            state.faults.pop_front()
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let row_errors = match fault {
            Some(MockFault::Transient) => {
                return Err(WarehouseError::WarehouseTransient {
                    message: "simulated backend error".to_string(),
                });
            }
            Some(MockFault::Permanent) => {
                return Err(WarehouseError::WarehousePermanent {
                    message: format!("simulated: table {table} not found"),
                });
            }
            Some(MockFault::RowErrors(errors)) => errors,
            Some(MockFault::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Vec::new()
            }
            None => Vec::new(),
        };

        let failed: BTreeSet<usize> = row_errors.iter().map(|e| e.index).collect();
        let accepted = rows
            .iter()
            .enumerate()
            .filter(|(i, _)| !failed.contains(i))
            .map(|(_, row)| row.clone());

        let mut state = self.lock();
        state.rows.extend(accepted);
        trace!(
            "Mock insert into {}: {} rows, {} total",
            table,
            rows.len(),
            state.rows.len()
        );

        Ok(InsertResponse { row_errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn table() -> TableRef {
        TableRef {
            project_id: "test".to_string(),
            dataset: "ingest".to_string(),
            table: "events".to_string(),
        }
    }

    fn rows(offsets: std::ops::Range<i64>) -> Vec<WarehouseRow> {
        offsets
            .map(|offset| WarehouseRow {
                insert_id: format!("events-0-{offset}"),
                json: Map::new(),
                partition: 0,
                offset,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let warehouse = MockWarehouse::new();
        warehouse.push_fault(MockFault::Transient);
        warehouse.push_fault(MockFault::Permanent);

        let first = warehouse.insert_rows(&table(), &rows(0..3)).await;
        assert!(first.unwrap_err().is_transient());
        let second = warehouse.insert_rows(&table(), &rows(0..3)).await;
        assert!(!second.unwrap_err().is_transient());
        let third = warehouse.insert_rows(&table(), &rows(0..3)).await.unwrap();
        assert!(third.row_errors.is_empty());

        assert_eq!(warehouse.call_sizes(), vec![3, 3, 3]);
        assert_eq!(warehouse.row_count(), 3);
    }

    #[tokio::test]
    async fn test_row_errors_keep_other_rows() {
        let warehouse = MockWarehouse::new();
        warehouse.push_fault(MockFault::RowErrors(vec![
            RowError::new(1, "invalid", "no such field: bogus"),
            RowError::new(3, "backendError", "try again"),
        ]));

        let response = warehouse.insert_rows(&table(), &rows(0..5)).await.unwrap();
        assert_eq!(response.row_errors.len(), 2);

        let offsets: Vec<i64> = warehouse.rows().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_unique_rows_ignore_replays() {
        let warehouse = MockWarehouse::new();
        warehouse.insert_rows(&table(), &rows(0..4)).await.unwrap();
        warehouse.insert_rows(&table(), &rows(2..6)).await.unwrap();

        assert_eq!(warehouse.row_count(), 8);
        assert_eq!(warehouse.unique_row_count(), 6);
        assert_eq!(warehouse.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_and_stall_delay_the_call() {
        let warehouse = MockWarehouse::new().with_latency(Duration::from_millis(20));
        warehouse.push_fault(MockFault::Stall(Duration::from_millis(100)));

        let start = tokio::time::Instant::now();
        warehouse.insert_rows(&table(), &rows(0..1)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(warehouse.row_count(), 1);
    }
}
