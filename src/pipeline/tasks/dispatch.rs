//! Background dispatch task.
//!
//! Pulls batches off the poll workers' channel and runs them through the
//! sink, at most `max_in_flight_batches` at a time. Acks feed the offset
//! committer; failures are routed by the sink's failure policy.

use futures::stream::{FuturesUnordered, StreamExt};
use snafu::ResultExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchSummary};
use crate::checkpoint::OffsetCommitter;
use crate::config::FailurePolicy;
use crate::dlq::{DeadLetter, DeadLetterKind, FailureTracker};
use crate::emit;
use crate::error::{PipelineError, SinkError, TaskJoinSnafu};
use crate::gate::{AdmissionGate, Permit};
use crate::metrics::events::{BatchAcked, BatchLost, BatchOutcome, BufferedBatches};
use crate::metrics::{ErrorKind, MetricSample, MetricsCollector};
use crate::sink::{Ack, Sink};

use super::until;

/// Future type for a batch travelling through the sink.
type SinkFuture = Pin<Box<dyn Future<Output = SinkCompletion> + Send>>;

struct SinkCompletion {
    batch_id: u64,
    started: Instant,
    result: Result<Ack, SinkError>,
}

#[derive(Debug, Clone, Copy)]
pub(in crate::pipeline) struct DispatchSettings {
    pub drain_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Copy, Default)]
pub(in crate::pipeline) struct DispatchStats {
    pub batches_acked: u64,
    pub records_ingested: u64,
    pub rows_rejected: u64,
    pub batches_failed: u64,
}

#[derive(Debug, Default)]
pub(in crate::pipeline) struct DispatchOutcome {
    /// Batches still queued or in the sink when the drain timed out.
    pub abandoned: Vec<BatchSummary>,
    /// Why the run must end as failed, if it must.
    pub fatal: Option<String>,
    pub stats: DispatchStats,
}

/// Handle to the background dispatcher task.
pub(in crate::pipeline) struct Dispatcher {
    pub tx: mpsc::Sender<Batch>,
    /// Cancelled once no more batches will be sent.
    closing: CancellationToken,
    handle: JoinHandle<(DispatchOutcome, FailureTracker)>,
}

impl Dispatcher {
    /// Spawn the dispatcher.
    ///
    /// `poll_token` is the token the poll workers stop on; the dispatcher
    /// cancels it itself on a fatal batch failure. The drain clock starts
    /// when it fires or when [`finish`](Self::finish) is called, whichever
    /// comes first.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        sink: Arc<Sink>,
        gate: AdmissionGate,
        committer: Arc<OffsetCommitter>,
        collector: Arc<MetricsCollector>,
        tracker: FailureTracker,
        poll_token: CancellationToken,
        buffer_size: usize,
        settings: DispatchSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let closing = CancellationToken::new();

        let state = DispatchState {
            sink,
            gate,
            committer,
            collector,
            tracker,
            poll_token,
            closing: closing.clone(),
            settings,
            tasks: FuturesUnordered::new(),
            in_flight: HashMap::new(),
            staged: None,
            channel_open: true,
            outcome: DispatchOutcome::default(),
        };
        let handle = tokio::spawn(state.run(rx));

        Self {
            tx,
            closing,
            handle,
        }
    }

    /// Wait for every queued batch to be acked, failed or abandoned.
    ///
    /// Hands the failure tracker back so batches lost outside the
    /// dispatcher can still be dead-lettered before the DLQ is finalized.
    pub async fn finish(self) -> Result<(DispatchOutcome, FailureTracker), PipelineError> {
        drop(self.tx);
        self.closing.cancel();
        self.handle.await.context(TaskJoinSnafu)
    }
}

struct DispatchState {
    sink: Arc<Sink>,
    gate: AdmissionGate,
    committer: Arc<OffsetCommitter>,
    collector: Arc<MetricsCollector>,
    tracker: FailureTracker,
    poll_token: CancellationToken,
    closing: CancellationToken,
    settings: DispatchSettings,
    /// Batches currently inside the sink.
    tasks: FuturesUnordered<SinkFuture>,
    in_flight: HashMap<u64, BatchSummary>,
    /// A batch received from the channel, waiting for a permit.
    staged: Option<Batch>,
    channel_open: bool,
    outcome: DispatchOutcome,
}

impl DispatchState {
    async fn run(mut self, mut rx: mpsc::Receiver<Batch>) -> (DispatchOutcome, FailureTracker) {
        let mut deadline: Option<Instant> = None;

        loop {
            if !self.channel_open && self.staged.is_none() && self.tasks.is_empty() {
                break;
            }

            if deadline.is_none() && self.draining() {
                deadline = Some(Instant::now() + self.settings.drain_timeout);
                info!(
                    "[dispatch] Draining {} in-flight and {} queued batches (timeout {:?})",
                    self.tasks.len(),
                    rx.len() + usize::from(self.staged.is_some()),
                    self.settings.drain_timeout
                );
            }

            let staged = self.staged.is_some();
            let can_receive = !staged && self.channel_open;

            tokio::select! {
                biased;

                Some(done) = self.tasks.next(), if !self.tasks.is_empty() => {
                    self.complete(done).await;
                }

                _ = until(deadline) => {
                    self.abandon(&mut rx).await;
                    break;
                }

                permit = self.gate.acquire(), if staged => {
                    match (permit, self.staged.take()) {
                        (Ok(permit), Some(batch)) => self.launch(batch, permit),
                        (Err(e), batch) => {
                            warn!("[dispatch] {}", e);
                            self.staged = batch;
                            self.abandon(&mut rx).await;
                            break;
                        }
                        (Ok(_), None) => {}
                    }
                }

                received = rx.recv(), if can_receive => {
                    match received {
                        Some(batch) => {
                            self.staged = Some(batch);
                            emit!(BufferedBatches { count: rx.len() });
                        }
                        None => {
                            debug!(
                                "[dispatch] Channel closed, {} batches in flight",
                                self.tasks.len()
                            );
                            self.channel_open = false;
                        }
                    }
                }

                _ = self.poll_token.cancelled(), if deadline.is_none() => {}

                _ = self.closing.cancelled(), if deadline.is_none() => {}
            }
        }

        emit!(BufferedBatches { count: 0 });

        let stats = &self.outcome.stats;
        info!(
            "[dispatch] Finished: {} batches acked ({} records), {} failed, {} abandoned",
            stats.batches_acked,
            stats.records_ingested,
            stats.batches_failed,
            self.outcome.abandoned.len()
        );
        (self.outcome, self.tracker)
    }

    fn draining(&self) -> bool {
        self.poll_token.is_cancelled() || self.closing.is_cancelled() || !self.channel_open
    }

    fn launch(&mut self, batch: Batch, permit: Permit) {
        let batch_id = batch.id;
        debug!(
            "[dispatch] Sending batch {} ({} records, in flight: {})",
            batch_id,
            batch.len(),
            self.gate.in_flight()
        );
        self.in_flight.insert(batch_id, batch.summary());

        let sink = self.sink.clone();
        self.tasks.push(Box::pin(async move {
            let _permit = permit;
            let started = Instant::now();
            let result = sink.append(batch).await;
            SinkCompletion {
                batch_id,
                started,
                result,
            }
        }));
    }

    async fn complete(&mut self, done: SinkCompletion) {
        let Some(summary) = self.in_flight.remove(&done.batch_id) else {
            return;
        };

        match done.result {
            Ok(ack) => self.acked(ack, done.started.elapsed()).await,
            Err(e) => self.failed(summary, e).await,
        }
    }

    async fn acked(&mut self, ack: Ack, latency: Duration) {
        let topic = self.committer.topic().to_string();

        self.collector
            .record(MetricSample::batch(latency, ack.accepted as u64));
        if ack.attempts > 1 {
            self.collector
                .record_errors(ErrorKind::SinkTransient, u64::from(ack.attempts - 1));
        }

        if !ack.rejected.is_empty() {
            let rejected = ack.rejected.len() as u64;
            self.collector.record_errors(ErrorKind::RowRejected, rejected);
            self.outcome.stats.rows_rejected += rejected;
            let letters = ack
                .rejected
                .iter()
                .map(|row| DeadLetter::rejected_row(&topic, ack.batch_id, row))
                .collect();
            self.tracker.dead_letter(letters).await;
        }

        for (partition, offset) in self.committer.on_ack(&ack).await {
            self.collector.observe_committed(partition, offset);
        }

        self.outcome.stats.batches_acked += 1;
        self.outcome.stats.records_ingested += ack.accepted as u64;
        emit!(BatchAcked {
            records: ack.accepted as u64,
            latency,
        });
    }

    async fn failed(&mut self, summary: BatchSummary, e: SinkError) {
        error!("[dispatch] Batch {} failed: {}", summary.id, e);
        self.collector.record_errors(ErrorKind::SinkPermanent, 1);
        self.outcome.stats.batches_failed += 1;
        emit!(BatchLost {
            outcome: BatchOutcome::Failed,
            records: summary.records as u64,
        });

        match self.settings.failure_policy {
            FailurePolicy::Skip => {
                let letters = DeadLetter::for_batch(
                    DeadLetterKind::FailedBatch,
                    self.committer.topic(),
                    &summary,
                    &e.to_string(),
                );
                if let Err(fatal) = self.tracker.record_failure(letters).await {
                    self.fail_run(fatal.to_string());
                }
                for (partition, offset) in self.committer.on_failed(summary.id).await {
                    self.collector.observe_committed(partition, offset);
                }
            }
            FailurePolicy::Abort => self.fail_run(e.to_string()),
        }
    }

    fn fail_run(&mut self, reason: String) {
        if self.outcome.fatal.is_none() {
            warn!("[dispatch] Stopping run: {}", reason);
            self.outcome.fatal = Some(reason);
        }
        self.poll_token.cancel();
    }

    /// Give up on everything not yet acked: the sink calls in flight, the
    /// staged batch and whatever is still queued.
    async fn abandon(&mut self, rx: &mut mpsc::Receiver<Batch>) {
        self.tasks.clear();
        self.gate.close();
        rx.close();

        let mut abandoned: Vec<BatchSummary> = self.in_flight.drain().map(|(_, s)| s).collect();
        abandoned.extend(self.staged.take().map(|batch| batch.summary()));
        while let Ok(batch) = rx.try_recv() {
            abandoned.push(batch.summary());
        }
        abandoned.sort_by_key(|summary| summary.id);
        self.channel_open = false;

        if abandoned.is_empty() {
            return;
        }
        warn!(
            "[dispatch] Drain timed out, abandoning {} batches",
            abandoned.len()
        );

        let topic = self.committer.topic().to_string();
        for summary in &abandoned {
            let letters = DeadLetter::for_batch(
                DeadLetterKind::AbandonedBatch,
                &topic,
                summary,
                "drain timeout elapsed before the batch was acknowledged",
            );
            self.tracker.dead_letter(letters).await;
            emit!(BatchLost {
                outcome: BatchOutcome::Abandoned,
                records: summary.records as u64,
            });
        }
        self.collector
            .record_errors(ErrorKind::Abandoned, abandoned.len() as u64);
        self.outcome.abandoned = abandoned;
    }
}
