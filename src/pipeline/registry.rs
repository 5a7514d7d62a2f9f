//! Registry of concurrent runs.
//!
//! Each run gets its own context (a shutdown token and a fresh metrics
//! collector) and its own task. The report is
//! published through a watch channel so any number of callers can wait.

use snafu::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::{ConfigSnafu, PipelineError, RunAbortedSnafu, RunActiveSnafu, UnknownRunSnafu};
use crate::metrics::{MetricsCollector, MetricsSnapshot};

use super::{Pipeline, PipelineParts, PipelineState, RunContext, RunId, RunReport};

struct RunEntry {
    ctx: RunContext,
    report: watch::Receiver<Option<RunReport>>,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `config` and start a run that connects to what it names.
    ///
    /// Connection failures surface in the run's report.
    pub async fn start_run(&self, config: Config) -> Result<RunId, PipelineError> {
        config.validate().context(ConfigSnafu)?;
        let pipeline = Pipeline::new(config.clone(), self.context(&config));
        let ctx = pipeline.context().clone();
        Ok(self.spawn(ctx, pipeline.run_from_config()).await)
    }

    /// Start a run over parts built by the caller.
    pub async fn start_run_with(
        &self,
        config: Config,
        parts: PipelineParts,
    ) -> Result<RunId, PipelineError> {
        config.validate().context(ConfigSnafu)?;
        let pipeline = Pipeline::new(config.clone(), self.context(&config));
        let ctx = pipeline.context().clone();
        Ok(self.spawn(ctx, pipeline.run(parts)).await)
    }

    /// Ask a run to drain and stop. Returns immediately; use [`wait`](Self::wait)
    /// for the report.
    pub async fn stop_run(&self, id: RunId) -> Result<(), PipelineError> {
        let runs = self.runs.lock().await;
        let entry = lookup(&runs, id)?;
        info!("Stopping run {}", id);
        entry.ctx.shutdown().cancel();
        Ok(())
    }

    pub async fn get_metrics(&self, id: RunId) -> Result<MetricsSnapshot, PipelineError> {
        let runs = self.runs.lock().await;
        Ok(lookup(&runs, id)?.ctx.collector().snapshot())
    }

    pub async fn state(&self, id: RunId) -> Result<PipelineState, PipelineError> {
        let runs = self.runs.lock().await;
        Ok(lookup(&runs, id)?.ctx.state())
    }

    /// Watch a run's lifecycle state.
    pub async fn subscribe(
        &self,
        id: RunId,
    ) -> Result<watch::Receiver<PipelineState>, PipelineError> {
        let runs = self.runs.lock().await;
        Ok(lookup(&runs, id)?.ctx.subscribe())
    }

    /// Wait for a run to stop and return its report.
    pub async fn wait(&self, id: RunId) -> Result<RunReport, PipelineError> {
        let mut report = {
            let runs = self.runs.lock().await;
            lookup(&runs, id)?.report.clone()
        };

        let aborted = || RunAbortedSnafu { id: id.to_string() };
        let published = report.wait_for(Option::is_some).await.ok().context(aborted())?;
        published.clone().context(aborted())
    }

    /// Remove a stopped run, returning its report.
    ///
    /// Runs stay registered after they stop so late callers can still read
    /// their report; long-lived callers forget them once consumed.
    pub async fn forget(&self, id: RunId) -> Result<RunReport, PipelineError> {
        let mut runs = self.runs.lock().await;
        let entry = lookup(&runs, id)?;
        let published = entry.report.borrow().clone();
        let task_gone = entry.report.has_changed().is_err();

        match published {
            Some(report) => {
                runs.remove(&id);
                info!("Forgot run {}", id);
                Ok(report)
            }
            None if task_gone => {
                runs.remove(&id);
                RunAbortedSnafu { id: id.to_string() }.fail()
            }
            None => RunActiveSnafu { id: id.to_string() }.fail(),
        }
    }

    /// Number of runs currently registered.
    pub async fn run_count(&self) -> usize {
        self.runs.lock().await.len()
    }

    fn context(&self, config: &Config) -> RunContext {
        let window = Duration::from_secs(config.metrics.window_secs);
        RunContext::new(
            CancellationToken::new(),
            Arc::new(MetricsCollector::new(window)),
        )
    }

    async fn spawn<F>(&self, ctx: RunContext, run: F) -> RunId
    where
        F: Future<Output = RunReport> + Send + 'static,
    {
        let id = ctx.id();
        let (tx, rx) = watch::channel(None);
        self.runs.lock().await.insert(
            id,
            RunEntry {
                ctx,
                report: rx,
            },
        );

        tokio::spawn(async move {
            let report = run.await;
            tx.send_replace(Some(report));
        });
        id
    }
}

fn lookup(runs: &HashMap<RunId, RunEntry>, id: RunId) -> Result<&RunEntry, PipelineError> {
    runs.get(&id).context(UnknownRunSnafu { id: id.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunStatus;

    fn synthetic_config(message_count: Option<u64>) -> Config {
        let count = message_count.map_or("null".to_string(), |n| n.to_string());
        let yaml = format!(
            r#"
source:
  topic: perf
  kind: synthetic
  partitions: [0, 1]
  partition_groups: 2
  max_poll_records: 50
  synthetic:
    message_count: {count}
sink:
  kind: mock
  dataset: ingest
  table: events
batch:
  max_count: 40
  max_age_ms: 50
checkpoint:
  path: "memory://"
metrics:
  enabled: false
"#
        );
        Config::from_yaml_with_options(&yaml, false).unwrap()
    }

    #[tokio::test]
    async fn test_synthetic_run_completes() {
        let registry = RunRegistry::new();
        let id = registry.start_run(synthetic_config(Some(300))).await.unwrap();

        let report = registry.wait(id).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stats.records_ingested, 300);
        assert_eq!(report.snapshot.total_records, 300);
        assert!(report.abandoned.is_empty());
        assert_eq!(registry.state(id).await.unwrap(), PipelineState::Stopped);

        let metrics = registry.get_metrics(id).await.unwrap();
        assert_eq!(metrics.total_records, 300);
    }

    #[tokio::test]
    async fn test_stop_run_cancels_unbounded_run() {
        let registry = RunRegistry::new();
        let id = registry.start_run(synthetic_config(None)).await.unwrap();

        let mut state = registry.subscribe(id).await.unwrap();
        state
            .wait_for(|s| *s == PipelineState::Running)
            .await
            .unwrap();

        registry.stop_run(id).await.unwrap();
        let report = registry.wait(id).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.abandoned.is_empty());
        assert_eq!(report.stats.records_ingested, report.stats.records_polled);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let registry = RunRegistry::new();
        let id = RunId::new();

        assert!(matches!(
            registry.stop_run(id).await,
            Err(PipelineError::UnknownRun { .. })
        ));
        assert!(matches!(
            registry.wait(id).await,
            Err(PipelineError::UnknownRun { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_running() {
        let registry = RunRegistry::new();
        let mut config = synthetic_config(Some(10));
        config.pipeline.max_in_flight_batches = 0;

        assert!(matches!(
            registry.start_run(config).await,
            Err(PipelineError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_forget_removes_stopped_run() {
        let registry = RunRegistry::new();
        let first = registry.start_run(synthetic_config(Some(20))).await.unwrap();
        let second = registry.start_run(synthetic_config(Some(20))).await.unwrap();
        assert_eq!(registry.run_count().await, 2);

        let waited = registry.wait(first).await.unwrap();
        let forgotten = registry.forget(first).await.unwrap();
        assert_eq!(waited.stats, forgotten.stats);
        assert_eq!(registry.run_count().await, 1);
        assert!(matches!(
            registry.state(first).await,
            Err(PipelineError::UnknownRun { .. })
        ));
        assert!(matches!(
            registry.forget(first).await,
            Err(PipelineError::UnknownRun { .. })
        ));

        registry.wait(second).await.unwrap();
        registry.forget(second).await.unwrap();
        assert_eq!(registry.run_count().await, 0);
    }

    #[tokio::test]
    async fn test_forget_keeps_active_run() {
        let registry = RunRegistry::new();
        let id = registry.start_run(synthetic_config(None)).await.unwrap();
        let mut state = registry.subscribe(id).await.unwrap();
        state
            .wait_for(|s| *s == PipelineState::Running)
            .await
            .unwrap();

        assert!(matches!(
            registry.forget(id).await,
            Err(PipelineError::RunActive { .. })
        ));
        assert_eq!(registry.run_count().await, 1);

        registry.stop_run(id).await.unwrap();
        registry.wait(id).await.unwrap();
        let report = registry.forget(id).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(registry.run_count().await, 0);
    }

    #[tokio::test]
    async fn test_wait_can_be_called_twice() {
        let registry = RunRegistry::new();
        let id = registry.start_run(synthetic_config(Some(20))).await.unwrap();

        let first = registry.wait(id).await.unwrap();
        let second = registry.wait(id).await.unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.stats, second.stats);
    }
}
