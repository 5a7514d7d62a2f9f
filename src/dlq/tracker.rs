//! Failure tracking with DLQ integration.
//!
//! Counts failed batches against `max_failures` and routes their dead
//! letters to the DLQ when one is configured.

use std::sync::Arc;
use tracing::error;

use crate::error::{MaxFailuresExceededSnafu, PipelineError};

use super::{DeadLetter, DeadLetterQueue};

pub struct FailureTracker {
    count: usize,
    max_failures: usize,
    dlq: Option<Arc<DeadLetterQueue>>,
}

impl FailureTracker {
    /// `max_failures` of 0 means unlimited.
    pub fn new(max_failures: usize, dlq: Option<Arc<DeadLetterQueue>>) -> Self {
        Self {
            count: 0,
            max_failures,
            dlq,
        }
    }

    /// Count one failure and dead-letter its records.
    ///
    /// Returns `Err` once `max_failures` has been reached.
    pub async fn record_failure(&mut self, letters: Vec<DeadLetter>) -> Result<(), PipelineError> {
        self.count += 1;
        self.dead_letter(letters).await;

        if self.max_failures > 0 && self.count >= self.max_failures {
            error!("Max failures ({}) reached, stopping pipeline", self.count);
            return MaxFailuresExceededSnafu { count: self.count }.fail();
        }

        Ok(())
    }

    /// Dead-letter records without counting a failure.
    pub async fn dead_letter(&self, letters: Vec<DeadLetter>) {
        if let Some(dlq) = &self.dlq {
            dlq.record(letters).await;
        }
    }

    /// Finalize DLQ, logging any errors.
    pub async fn finalize_dlq(&self) {
        if let Some(dlq) = &self.dlq
            && let Err(e) = dlq.finalize().await
        {
            error!("Failed to finalize DLQ: {}", e);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
