//! Periodic performance report.

use snafu::ResultExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::emit;
use crate::error::{PipelineError, TaskJoinSnafu};
use crate::metrics::events::CommitLag;
use crate::metrics::{MetricsCollector, MetricsSnapshot};

pub(in crate::pipeline) struct Reporter {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reporter {
    pub fn spawn(collector: Arc<MetricsCollector>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Self::run(collector, interval, stop.clone()));
        Self { stop, handle }
    }

    pub async fn finish(self) -> Result<(), PipelineError> {
        self.stop.cancel();
        self.handle.await.context(TaskJoinSnafu)
    }

    async fn run(collector: Arc<MetricsCollector>, interval: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => log_snapshot("[report]", &collector.snapshot()),
            }
        }
    }
}

/// Log a snapshot and refresh the commit lag gauges.
pub(in crate::pipeline) fn log_snapshot(prefix: &str, snapshot: &MetricsSnapshot) {
    info!(
        "{} {} records in {} batches over {:.1}s, {:.1} records/s (window {:.1} records/s), {} errors",
        prefix,
        snapshot.total_records,
        snapshot.total_batches,
        snapshot.elapsed_secs,
        snapshot.overall_throughput,
        snapshot.throughput,
        snapshot.total_errors
    );
    if snapshot.window_batches > 0 {
        let latency = &snapshot.latency;
        info!(
            "{} Batch latency ms: p50 {:.1}, p95 {:.1}, p99 {:.1}, min {:.1}, max {:.1}, mean {:.1}",
            prefix,
            latency.p50_ms,
            latency.p95_ms,
            latency.p99_ms,
            latency.min_ms,
            latency.max_ms,
            latency.mean_ms
        );
    }
    for (partition, lag) in &snapshot.commit_lag {
        emit!(CommitLag {
            partition: *partition,
            lag: *lag,
        });
    }
}
