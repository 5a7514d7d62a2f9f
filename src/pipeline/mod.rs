//! Main ingestion pipeline.
//!
//! Connects the sources, the sink and the offset committer into a streaming
//! pipeline with backpressure and graceful shutdown.
//!
//! # Architecture
//!
//! - **Poll workers**: one per partition group, each polling its source and
//!   forming batches
//! - **Dispatcher**: runs batches through the sink, bounded by the
//!   admission gate, and resolves them with the committer
//! - **Flusher / reporter**: persist checkpoints and log snapshots on an
//!   interval
//!
//! A run moves `Created → Running → Draining → Stopped`. Stopping a run (or
//! a fatal failure) cancels the poll workers, which flush their batchers;
//! the dispatcher then has `drain_timeout` to get every queued batch acked
//! before the rest is abandoned.

mod context;
mod registry;
mod tasks;

pub use context::{PipelineState, RunContext, RunId};
pub use registry::RunRegistry;

use futures::stream::{FuturesUnordered, StreamExt};
use snafu::ErrorCompat;
use snafu::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::{BatchIds, BatchLimits, BatchSummary, Batcher};
use crate::checkpoint::{CheckpointStore, ObjectCheckpointStore, OffsetCommitter};
use crate::config::Config;
use crate::dlq::{DeadLetter, DeadLetterKind, DeadLetterQueue, FailureTracker};
use crate::emit;
use crate::error::{
    CheckpointSnafu, ConfigSnafu, DlqSnafu, PipelineError, PipelineStorageSnafu, SourceSnafu,
};
use crate::gate::AdmissionGate;
use crate::metrics::events::{BatchLost, BatchOutcome};
use crate::metrics::{ErrorKind, MetricsCollector, MetricsSnapshot};
use crate::signal::shutdown_signal;
use crate::sink::{BackoffPolicy, RetryPolicy, Sink, TableRef, Warehouse, warehouse_from_config};
use crate::source::{self, RecordSource};
use crate::storage::StorageProvider;

use tasks::{
    CommitFlusher, DispatchSettings, Dispatcher, PollSettings, PollWorker, Reporter, log_snapshot,
};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every source was exhausted and every batch resolved.
    Completed,
    /// A fatal error ended the run.
    Failed(String),
    /// The run was stopped before its sources were exhausted.
    Cancelled,
}

/// Counters describing a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub records_polled: u64,
    pub batches_formed: u64,
    pub batches_acked: u64,
    pub records_ingested: u64,
    pub rows_rejected: u64,
    pub batches_failed: u64,
    pub batches_abandoned: u64,
    /// Highest number of batches inside the sink at once.
    pub peak_in_flight: usize,
    pub checkpoints_persisted: u64,
    pub commit_failures: u64,
    /// Last committed offset per partition.
    pub committed: BTreeMap<i32, i64>,
}

/// Outcome of a run, produced however it ended.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub snapshot: MetricsSnapshot,
    /// Batches that were never acknowledged, ordered by id.
    pub abandoned: Vec<BatchSummary>,
    pub stats: RunStats,
}

impl RunReport {
    fn failed(reason: String, snapshot: MetricsSnapshot) -> Self {
        Self {
            status: RunStatus::Failed(reason),
            snapshot,
            abandoned: Vec::new(),
            stats: RunStats::default(),
        }
    }
}

/// The external systems a run talks to.
pub struct PipelineParts {
    /// One source per poll worker.
    pub sources: Vec<Box<dyn RecordSource>>,
    pub warehouse: Arc<dyn Warehouse>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub dlq: Option<Arc<DeadLetterQueue>>,
}

impl PipelineParts {
    /// Connect to everything the configuration names.
    pub async fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let warehouse = warehouse_from_config(&config.sink).context(ConfigSnafu)?;

        let checkpoint_storage = StorageProvider::for_url_with_options(
            &config.checkpoint.path,
            config.checkpoint.storage_options.clone(),
        )
        .await
        .context(PipelineStorageSnafu)?;
        let checkpoint_store = Arc::new(ObjectCheckpointStore::new(Arc::new(checkpoint_storage)));

        let dlq = DeadLetterQueue::from_config(&config.error_handling)
            .await
            .context(DlqSnafu)?
            .map(Arc::new);

        let sources = source::from_config(&config.source)
            .await
            .context(SourceSnafu)?;

        Ok(Self {
            sources,
            warehouse,
            checkpoint_store,
            dlq,
        })
    }
}

/// A single ingestion run.
pub struct Pipeline {
    config: Config,
    ctx: RunContext,
}

impl Pipeline {
    pub fn new(config: Config, ctx: RunContext) -> Self {
        Self { config, ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Connect the configured parts, then run.
    pub async fn run_from_config(self) -> RunReport {
        match PipelineParts::from_config(&self.config).await {
            Ok(parts) => self.run(parts).await,
            Err(e) => self.fail(&e),
        }
    }

    /// Run until the sources are exhausted or the run is stopped.
    ///
    /// Always ends in `Stopped` and always produces a report.
    pub async fn run(self, parts: PipelineParts) -> RunReport {
        match self.execute(parts).await {
            Ok(report) => report,
            Err(e) => self.fail(&e),
        }
    }

    fn fail(&self, e: &PipelineError) -> RunReport {
        let reason = error_chain(e);
        error!("Run {} failed: {}", self.ctx.id(), reason);
        self.ctx.transition(PipelineState::Stopped);
        RunReport::failed(reason, self.ctx.collector().snapshot())
    }

    async fn execute(&self, parts: PipelineParts) -> Result<RunReport, PipelineError> {
        let PipelineParts {
            mut sources,
            warehouse,
            checkpoint_store,
            dlq,
        } = parts;
        let config = &self.config;
        let options = config.run_options();
        let collector = self.ctx.collector().clone();
        let topic = config.source.topic.clone();

        let committer = Arc::new(OffsetCommitter::new(topic.clone(), checkpoint_store));
        let restored = committer.restore().await.context(CheckpointSnafu)?;

        let mut partitions = BTreeSet::new();
        for source in &mut sources {
            for partition in source.assignment() {
                if let Some(offset) = restored.get(&partition) {
                    source.seek(partition, offset + 1);
                    collector.observe_committed(partition, *offset);
                }
                partitions.insert(partition);
            }
        }

        self.ctx.transition(PipelineState::Running);
        info!(
            "Starting run {}: topic {} partitions {:?} across {} workers into {}",
            self.ctx.id(),
            topic,
            partitions,
            sources.len(),
            TableRef::from(&config.sink)
        );

        // Cancelled by a stop request or by a fatal failure inside the run.
        let poll_token = self.ctx.shutdown().child_token();
        let gate = AdmissionGate::new(options.max_in_flight_batches);
        let sink = Arc::new(Sink::new(
            warehouse,
            TableRef::from(&config.sink),
            topic.clone(),
            RetryPolicy::from(&config.sink),
        ));

        let dispatcher = Dispatcher::spawn(
            sink,
            gate.clone(),
            committer.clone(),
            collector.clone(),
            FailureTracker::new(config.error_handling.max_failures, dlq),
            poll_token.clone(),
            config.pipeline.max_buffered_batches,
            DispatchSettings {
                drain_timeout: options.drain_timeout(),
                failure_policy: config.sink.failure_policy,
            },
        );
        let flusher = CommitFlusher::spawn(
            committer.clone(),
            collector.clone(),
            Duration::from_secs(config.checkpoint.interval_secs),
        );
        let reporter = Reporter::spawn(
            collector.clone(),
            Duration::from_secs(config.metrics.report_interval_secs),
        );

        let settings = PollSettings {
            max_wait: Duration::from_millis(config.source.poll_max_wait_ms),
            retry: BackoffPolicy::new(
                Duration::from_millis(config.source.retry_initial_ms),
                Duration::from_millis(config.source.retry_max_ms),
            ),
        };
        let ids = BatchIds::default();
        let limits = BatchLimits::from(&options);
        let mut workers: FuturesUnordered<_> = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| {
                PollWorker::spawn(
                    index,
                    source,
                    Batcher::with_ids(limits, ids.clone()),
                    committer.clone(),
                    dispatcher.tx.clone(),
                    collector.clone(),
                    poll_token.clone(),
                    settings,
                )
                .finish()
            })
            .collect();

        let mut stats = RunStats::default();
        let mut unsent: Vec<BatchSummary> = Vec::new();
        let mut fatal: Option<String> = None;

        loop {
            let running = self.ctx.state() == PipelineState::Running;
            tokio::select! {
                biased;

                _ = poll_token.cancelled(), if running => {
                    self.ctx.transition(PipelineState::Draining);
                }

                finished = workers.next() => match finished {
                    Some(Ok(outcome)) => {
                        stats.records_polled += outcome.records;
                        stats.batches_formed += outcome.batches;
                        unsent.extend(outcome.unsent);
                    }
                    Some(Err(e)) => {
                        let reason = error_chain(&e);
                        error!("[poll] Worker failed: {}", reason);
                        fatal.get_or_insert(reason);
                        poll_token.cancel();
                    }
                    None => break,
                },
            }
        }
        self.ctx.transition(PipelineState::Draining);

        let (dispatch, tracker) = dispatcher.finish().await?;

        if !unsent.is_empty() {
            warn!("{} batches formed after the dispatcher stopped", unsent.len());
            collector.record_errors(ErrorKind::Abandoned, unsent.len() as u64);
            for summary in &unsent {
                emit!(BatchLost {
                    outcome: BatchOutcome::Abandoned,
                    records: summary.records as u64,
                });
                tracker
                    .dead_letter(DeadLetter::for_batch(
                        DeadLetterKind::AbandonedBatch,
                        &topic,
                        summary,
                        "batch formed after the dispatcher stopped",
                    ))
                    .await;
            }
        }
        tracker.finalize_dlq().await;

        let mut commits = flusher.finish().await?;
        commits.persist(&committer, &collector).await;
        reporter.finish().await?;

        let mut abandoned = dispatch.abandoned;
        abandoned.extend(unsent);
        abandoned.sort_by_key(|summary| summary.id);

        stats.batches_acked = dispatch.stats.batches_acked;
        stats.records_ingested = dispatch.stats.records_ingested;
        stats.rows_rejected = dispatch.stats.rows_rejected;
        stats.batches_failed = dispatch.stats.batches_failed;
        stats.batches_abandoned = abandoned.len() as u64;
        stats.peak_in_flight = gate.peak();
        stats.checkpoints_persisted = commits.persisted;
        stats.commit_failures = commits.failures;
        stats.committed = committer
            .checkpoints_on(partitions.iter().copied())
            .await
            .into_iter()
            .collect();

        let status = if let Some(reason) = dispatch.fatal.or(fatal) {
            RunStatus::Failed(reason)
        } else if self.ctx.shutdown().is_cancelled() {
            RunStatus::Cancelled
        } else if !abandoned.is_empty() {
            RunStatus::Failed(format!(
                "{} batches were not acknowledged before the drain timeout",
                abandoned.len()
            ))
        } else {
            RunStatus::Completed
        };

        let snapshot = collector.snapshot();
        log_snapshot("[report] Final:", &snapshot);
        info!(
            "Run {} finished ({:?}): {} records ingested, {} rows rejected, {} batches failed, {} abandoned",
            self.ctx.id(),
            status,
            stats.records_ingested,
            stats.rows_rejected,
            stats.batches_failed,
            stats.batches_abandoned
        );
        self.ctx.transition(PipelineState::Stopped);

        Ok(RunReport {
            status,
            snapshot,
            abandoned,
            stats,
        })
    }
}

/// Render an error with its causes, outermost first.
fn error_chain(e: &PipelineError) -> String {
    e.iter_chain()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// Run the pipeline with the given configuration until it completes or a
/// shutdown signal arrives.
pub async fn run_pipeline(config: Config) -> Result<RunReport, PipelineError> {
    config.validate().context(ConfigSnafu)?;
    let shutdown = CancellationToken::new();

    // Set up signal handler for graceful shutdown
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let collector = Arc::new(MetricsCollector::new(Duration::from_secs(
        config.metrics.window_secs,
    )));
    let ctx = RunContext::new(shutdown, collector);
    Ok(Pipeline::new(config, ctx).run_from_config().await)
}
