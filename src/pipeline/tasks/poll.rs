//! Poll workers.
//!
//! Each worker owns one source (a partition group) and one batcher. The
//! source is read by its own task feeding a channel, so the batching loop
//! only ever selects over cancel-safe futures while a fetch is in progress.

use snafu::ResultExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchSummary, Batcher};
use crate::checkpoint::OffsetCommitter;
use crate::emit;
use crate::error::{PipelineError, SourceError, SourceSnafu, TaskJoinSnafu};
use crate::metrics::events::{RecordsPolled, SourceUnavailable};
use crate::metrics::{ErrorKind, MetricSample, MetricsCollector};
use crate::sink::{Backoff, BackoffPolicy};
use crate::source::{Record, RecordSource};

use super::until;

/// Record buffers queued between the source reader and the batcher.
const READ_AHEAD: usize = 2;

#[derive(Debug, Clone, Copy)]
pub(in crate::pipeline) struct PollSettings {
    pub max_wait: Duration,
    pub retry: BackoffPolicy,
}

/// What a poll worker did before it stopped.
#[derive(Debug, Default)]
pub(in crate::pipeline) struct PollOutcome {
    pub records: u64,
    pub batches: u64,
    /// Batches formed but never handed to the dispatcher.
    pub unsent: Vec<BatchSummary>,
}

pub(in crate::pipeline) struct PollWorker {
    handle: JoinHandle<Result<PollOutcome, PipelineError>>,
}

impl PollWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        index: usize,
        source: Box<dyn RecordSource>,
        batcher: Batcher,
        committer: Arc<OffsetCommitter>,
        batch_tx: mpsc::Sender<Batch>,
        collector: Arc<MetricsCollector>,
        token: CancellationToken,
        settings: PollSettings,
    ) -> Self {
        let (records_tx, records_rx) = mpsc::channel(READ_AHEAD);
        let reader = tokio::spawn(read_source(
            index,
            source,
            records_tx,
            collector,
            token,
            settings,
        ));

        let handle = tokio::spawn(run_batcher(
            index, batcher, records_rx, reader, committer, batch_tx,
        ));

        Self { handle }
    }

    /// Wait for the worker to flush its batcher and stop.
    pub async fn finish(self) -> Result<PollOutcome, PipelineError> {
        self.handle.await.context(TaskJoinSnafu)?
    }
}

/// Poll the source until it is exhausted, cancelled or fails for good.
async fn read_source(
    index: usize,
    mut source: Box<dyn RecordSource>,
    records_tx: mpsc::Sender<Vec<Record>>,
    collector: Arc<MetricsCollector>,
    token: CancellationToken,
    settings: PollSettings,
) -> Result<u64, SourceError> {
    let mut backoff = Backoff::new(settings.retry);
    let mut polled = 0u64;
    debug!(
        "[poll] Worker {} reading partitions {:?}",
        index,
        source.assignment()
    );

    loop {
        if source.is_exhausted() {
            info!("[poll] Worker {} source exhausted after {} records", index, polled);
            break;
        }

        let result = tokio::select! {
            biased;

            _ = token.cancelled() => {
                debug!("[poll] Worker {} stopping", index);
                break;
            }

            result = source.poll(settings.max_wait) => result,
        };

        match result {
            Ok(records) => {
                backoff.reset();
                if records.is_empty() {
                    continue;
                }

                let mut last_read: BTreeMap<i32, i64> = BTreeMap::new();
                let mut bytes = 0u64;
                for record in &records {
                    bytes += record.byte_size() as u64;
                    let last = last_read.entry(record.partition).or_insert(record.offset);
                    *last = (*last).max(record.offset);
                }
                for (partition, offset) in last_read {
                    collector.observe_read(partition, offset);
                }
                polled += records.len() as u64;
                emit!(RecordsPolled {
                    count: records.len() as u64,
                    bytes,
                });

                if records_tx.send(records).await.is_err() {
                    break;
                }
            }
            Err(e) if e.is_transient() => {
                emit!(SourceUnavailable);
                collector.record(MetricSample::error(ErrorKind::SourceUnavailable));
                let delay = backoff.next_delay();
                warn!(
                    "[poll] Worker {} poll failed ({}), retrying in {:?}",
                    index, e, delay
                );
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(polled)
}

/// Turn polled records into batches and hand them to the dispatcher.
async fn run_batcher(
    index: usize,
    mut batcher: Batcher,
    mut records_rx: mpsc::Receiver<Vec<Record>>,
    reader: JoinHandle<Result<u64, SourceError>>,
    committer: Arc<OffsetCommitter>,
    batch_tx: mpsc::Sender<Batch>,
) -> Result<PollOutcome, PipelineError> {
    let mut outcome = PollOutcome::default();
    let mut dispatcher_open = true;

    loop {
        tokio::select! {
            biased;

            // Wakes exactly when the open batch reaches max_age.
            _ = until(batcher.deadline()) => {
                if let Some(batch) = batcher.tick(Instant::now()) {
                    forward(batch, &committer, &batch_tx, &mut dispatcher_open, &mut outcome).await;
                }
            }

            received = records_rx.recv() => {
                let Some(records) = received else {
                    break;
                };
                for record in records {
                    if let Some(batch) = batcher.add(record) {
                        forward(batch, &committer, &batch_tx, &mut dispatcher_open, &mut outcome).await;
                    }
                }
            }
        }
    }

    while let Some(batch) = batcher.flush_now() {
        forward(batch, &committer, &batch_tx, &mut dispatcher_open, &mut outcome).await;
    }
    drop(batch_tx);

    outcome.records = reader
        .await
        .context(TaskJoinSnafu)?
        .context(SourceSnafu)?;
    debug!(
        "[poll] Worker {} finished: {} records in {} batches",
        index, outcome.records, outcome.batches
    );
    Ok(outcome)
}

/// Register a batch with the committer, then queue it for dispatch.
async fn forward(
    batch: Batch,
    committer: &OffsetCommitter,
    batch_tx: &mpsc::Sender<Batch>,
    dispatcher_open: &mut bool,
    outcome: &mut PollOutcome,
) {
    outcome.batches += 1;
    if !*dispatcher_open {
        outcome.unsent.push(batch.summary());
        return;
    }

    committer.register(&batch).await;
    let summary = batch.summary();
    if batch_tx.send(batch).await.is_err() {
        warn!("[poll] Dispatcher closed, batch {} not sent", summary.id);
        *dispatcher_open = false;
        outcome.unsent.push(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchLimits;
    use crate::checkpoint::ObjectCheckpointStore;
    use crate::storage::StorageProvider;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::collections::{BTreeSet, HashMap, VecDeque};

    /// Releases each record once its delay after creation has passed.
    struct TrickleSource {
        started: Instant,
        pending: VecDeque<(Duration, Record)>,
    }

    impl TrickleSource {
        fn new(delays: &[u64]) -> Self {
            let pending = delays
                .iter()
                .enumerate()
                .map(|(offset, ms)| {
                    let record = Record {
                        partition: 0,
                        offset: offset as i64,
                        key: None,
                        value: Bytes::from_static(b"{}"),
                        timestamp: Utc::now(),
                    };
                    (Duration::from_millis(*ms), record)
                })
                .collect();
            Self {
                started: Instant::now(),
                pending,
            }
        }
    }

    #[async_trait]
    impl RecordSource for TrickleSource {
        async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Record>, SourceError> {
            let wait_until = match self.pending.front() {
                Some((delay, _)) => (self.started + *delay).min(Instant::now() + max_wait),
                None => Instant::now() + max_wait,
            };
            tokio::time::sleep_until(wait_until).await;

            let mut due = Vec::new();
            while let Some((delay, _)) = self.pending.front() {
                if self.started + *delay > Instant::now() {
                    break;
                }
                if let Some((_, record)) = self.pending.pop_front() {
                    due.push(record);
                }
            }
            Ok(due)
        }

        fn assignment(&self) -> BTreeSet<i32> {
            BTreeSet::from([0])
        }

        fn seek(&mut self, _partition: i32, _next_offset: i64) {}
    }

    async fn committer() -> Arc<OffsetCommitter> {
        let storage = StorageProvider::for_url_with_options("memory://", HashMap::new())
            .await
            .unwrap();
        let store = ObjectCheckpointStore::new(Arc::new(storage));
        Arc::new(OffsetCommitter::new("events", Arc::new(store)))
    }

    fn settings() -> PollSettings {
        PollSettings {
            max_wait: Duration::from_millis(100),
            retry: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_partition_flushes_when_batch_reaches_max_age() {
        let max_age = Duration::from_secs(1);
        let batcher = Batcher::new(BatchLimits {
            max_bytes: 1 << 20,
            max_count: 100,
            max_age,
        });
        let (batch_tx, mut batch_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let worker = PollWorker::spawn(
            0,
            Box::new(TrickleSource::new(&[10, 1700])),
            batcher,
            committer().await,
            batch_tx,
            Arc::new(MetricsCollector::new(Duration::from_secs(60))),
            token.clone(),
            settings(),
        );

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].offset, 0);
        assert!(Instant::now() - batch.created_at <= max_age);

        token.cancel();
        let outcome = worker.finish().await.unwrap();
        assert!(outcome.unsent.is_empty());
        assert_eq!(outcome.records, 1);
        assert_eq!(outcome.batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flushes_partial_batch() {
        let batcher = Batcher::new(BatchLimits {
            max_bytes: 1 << 20,
            max_count: 100,
            max_age: Duration::from_secs(60),
        });
        let (batch_tx, mut batch_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let committer = committer().await;
        let worker = PollWorker::spawn(
            0,
            Box::new(TrickleSource::new(&[10, 20, 30])),
            batcher,
            committer.clone(),
            batch_tx,
            Arc::new(MetricsCollector::new(Duration::from_secs(60))),
            token.clone(),
            settings(),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
        let outcome = worker.finish().await.unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(outcome.batches, 1);
        assert_eq!(committer.pending_batches().await, 1);
    }
}
