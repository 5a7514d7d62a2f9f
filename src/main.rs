//! flurry: streams records from a Kafka topic into a BigQuery table.
//!
//! Batches adaptively, applies backpressure on the warehouse, and commits
//! offsets to its own checkpoint store only after the warehouse has
//! acknowledged them.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use flurry::config::Config;
use flurry::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError, RunFailedSnafu};
use flurry::metrics::{self, MetricsCollector};
use flurry::pipeline::{Pipeline, RunContext, RunStatus};
use flurry::shutdown_signal;
use flurry::sink::TableRef;

/// Kafka to BigQuery streaming ingestion.
#[derive(Parser, Debug)]
#[command(name = "flurry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("flurry starting");

    let config = build_config(&args)?;

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!(
            "Source: {:?} topic {} partitions {:?} in {} groups",
            config.source.kind,
            config.source.topic,
            config.source.partitions,
            config.source.partition_groups
        );
        info!("Sink: {:?} {}", config.sink.kind, TableRef::from(&config.sink));
        info!("Checkpoint: {}", config.checkpoint.path);
        info!("Run options: {:?}", config.run_options());
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let collector = Arc::new(MetricsCollector::new(Duration::from_secs(
        config.metrics.window_secs,
    )));
    let ctx = RunContext::new(shutdown.clone(), collector);

    // Initialize metrics if enabled
    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr, ctx.subscribe()).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    // Set up signal handler for graceful shutdown
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let report = Pipeline::new(config, ctx).run_from_config().await;

    info!("Run finished: {:?}", report.status);
    info!("  Records polled: {}", report.stats.records_polled);
    info!("  Records ingested: {}", report.stats.records_ingested);
    info!("  Rows rejected: {}", report.stats.rows_rejected);
    info!("  Batches acked: {}", report.stats.batches_acked);
    info!("  Batches failed: {}", report.stats.batches_failed);
    info!("  Batches abandoned: {}", report.stats.batches_abandoned);
    info!("  Peak in-flight batches: {}", report.stats.peak_in_flight);
    info!("  Committed offsets: {:?}", report.stats.committed);

    match report.status {
        RunStatus::Failed(reason) => RunFailedSnafu { reason }.fail(),
        RunStatus::Completed | RunStatus::Cancelled => Ok(()),
    }
}

/// Load and validate the configuration file.
fn build_config(args: &Args) -> Result<Config, PipelineError> {
    let config = Config::from_file(&args.config).context(ConfigSnafu)?;
    config.validate().context(ConfigSnafu)?;
    Ok(config)
}
