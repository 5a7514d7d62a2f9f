//! Periodic checkpoint persistence.

use snafu::ResultExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::checkpoint::OffsetCommitter;
use crate::error::{PipelineError, TaskJoinSnafu};
use crate::metrics::{ErrorKind, MetricsCollector};

#[derive(Debug, Clone, Copy, Default)]
pub(in crate::pipeline) struct CommitStats {
    pub persisted: u64,
    pub failures: u64,
}

impl CommitStats {
    /// Persist once, counting the outcome. Failures are left for the next call.
    pub async fn persist(&mut self, committer: &OffsetCommitter, collector: &MetricsCollector) {
        match committer.persist().await {
            Ok(true) => self.persisted += 1,
            Ok(false) => {}
            Err(_) => {
                self.failures += 1;
                collector.record_errors(ErrorKind::CommitFailure, 1);
            }
        }
    }
}

/// Handle to the background checkpoint flusher.
pub(in crate::pipeline) struct CommitFlusher {
    stop: CancellationToken,
    handle: JoinHandle<CommitStats>,
}

impl CommitFlusher {
    pub fn spawn(
        committer: Arc<OffsetCommitter>,
        collector: Arc<MetricsCollector>,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Self::run(committer, collector, interval, stop.clone()));
        Self { stop, handle }
    }

    /// Stop the flusher. The caller is expected to persist once more.
    pub async fn finish(self) -> Result<CommitStats, PipelineError> {
        self.stop.cancel();
        self.handle.await.context(TaskJoinSnafu)
    }

    async fn run(
        committer: Arc<OffsetCommitter>,
        collector: Arc<MetricsCollector>,
        interval: Duration,
        stop: CancellationToken,
    ) -> CommitStats {
        let mut stats = CommitStats::default();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    stats.persist(&committer, &collector).await;
                }
            }
        }

        debug!(
            "[commit] Flusher stopped: {} checkpoints written, {} failures",
            stats.persisted, stats.failures
        );
        stats
    }
}
