//! flurry: a library for streaming Kafka topics into BigQuery.
//!
//! This library provides the pieces of an at-least-once ingestion pipeline:
//! record sources, adaptive batching, an admission gate for backpressure, a
//! retrying warehouse sink, an offset committer and a metrics collector.
//!
//! # Example
//!
//! ```ignore
//! use flurry::{Config, RunRegistry, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("flurry.yaml").unwrap();
//!     let registry = RunRegistry::new();
//!     let id = registry.start_run(config).await?;
//!     let report = registry.wait(id).await?;
//!     println!("Ingested {} records", report.stats.records_ingested);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod dlq;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod pipeline;
pub mod signal;
pub mod sink;
pub mod source;
pub mod storage;

// Re-export main types
pub use config::{Config, RunOptions};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use pipeline::{
    Pipeline, PipelineParts, PipelineState, RunContext, RunId, RunRegistry, RunReport, RunStats,
    RunStatus, run_pipeline,
};
pub use signal::shutdown_signal;
pub use storage::{StorageProvider, StorageProviderRef};
