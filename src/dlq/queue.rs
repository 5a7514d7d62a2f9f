//! Dead Letter Queue implementation.
//!
//! Buffers dead letters and writes them as NDJSON. Every flush goes to its
//! own object, `failures-{run timestamp}-{sequence}.ndjson`, so earlier
//! flushes are never overwritten.

use bytes::Bytes;
use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ErrorHandlingConfig;
use crate::emit;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::metrics::events::DeadLettersWritten;
use crate::storage::{StorageProvider, StorageProviderRef};

use super::types::{DeadLetter, FailureStats};

const DEFAULT_BUFFER_SIZE: usize = 100;

pub struct DeadLetterQueue {
    storage: StorageProviderRef,
    prefix: String,
    sequence: AtomicU64,
    buffer: Mutex<Vec<DeadLetter>>,
    stats: Mutex<FailureStats>,
    buffer_size: usize,
}

impl DeadLetterQueue {
    /// Create a new DLQ from configuration.
    ///
    /// Returns `None` if no DLQ path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        info!("DLQ enabled: {}", storage.canonical_url());
        Ok(Some(Self::new(Arc::new(storage))))
    }

    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            prefix: format!("failures-{}", Utc::now().format("%Y%m%d-%H%M%S")),
            sequence: AtomicU64::new(0),
            buffer: Mutex::new(Vec::new()),
            stats: Mutex::new(FailureStats::default()),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Flush automatically once this many letters are buffered.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub async fn record(&self, letters: Vec<DeadLetter>) {
        if letters.is_empty() {
            return;
        }

        {
            let mut stats = self.stats.lock().await;
            for letter in &letters {
                debug!(
                    "Recording dead letter: {} partition {} offsets {}..={}",
                    letter.kind.as_str(),
                    letter.partition,
                    letter.first_offset,
                    letter.last_offset
                );
                stats.increment(letter.kind);
            }
        }

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.extend(letters);
            buffer.len() >= self.buffer_size
        };

        if should_flush && let Err(e) = self.flush().await {
            error!("Failed to flush DLQ: {}", e);
        }
    }

    /// Write buffered letters to a new object.
    ///
    /// On failure the letters are put back so a later flush can retry them.
    pub async fn flush(&self) -> Result<(), DlqError> {
        let letters = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let mut ndjson = String::new();
        for letter in &letters {
            let line = serde_json::to_string(letter).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = format!("{}-{:04}.ndjson", self.prefix, sequence);
        if let Err(source) = self.storage.put(path.as_str(), Bytes::from(ndjson)).await {
            let mut buffer = self.buffer.lock().await;
            let newer = std::mem::replace(&mut *buffer, letters);
            buffer.extend(newer);
            return Err(source).context(DlqWriteSnafu);
        }

        emit!(DeadLettersWritten {
            count: letters.len() as u64
        });
        info!("Flushed {} dead letters to {}", letters.len(), path);
        Ok(())
    }

    /// Flush everything still buffered and log a summary.
    pub async fn finalize(&self) -> Result<(), DlqError> {
        self.flush().await?;
        let stats = self.stats.lock().await;
        info!(
            "DLQ finalized: {} dead letters (rejected_rows={}, failed_batches={}, abandoned_batches={})",
            stats.total(),
            stats.rejected_rows,
            stats.failed_batches,
            stats.abandoned_batches
        );
        Ok(())
    }

    pub async fn stats(&self) -> FailureStats {
        *self.stats.lock().await
    }
}
