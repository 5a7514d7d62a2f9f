//! Configuration parsing and validation.
//!
//! Handles loading the pipeline configuration from YAML files with
//! environment variable interpolation, and exposes the per-run tuning
//! knobs as [`RunOptions`].

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, ConfigInvalidSnafu, EmptyBrokersSnafu, EmptyTableSnafu, EmptyTopicSnafu,
    EnvInterpolationSnafu, ReadFileSnafu, YamlParseSnafu,
};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Error handling configuration (optional).
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

/// Which record source feeds the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Kafka,
    Synthetic,
}

/// Where to start reading a partition that has no checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
}

/// Source configuration for consuming a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Topic to consume.
    pub topic: String,

    #[serde(default)]
    pub kind: SourceKind,

    /// Bootstrap brokers, e.g. `["localhost:9092"]`.
    #[serde(default)]
    pub brokers: Vec<String>,

    /// Partitions to consume (default: `[0]`).
    #[serde(default = "default_partitions")]
    pub partitions: Vec<i32>,

    /// Number of poll workers; partitions are spread round-robin across them.
    #[serde(default = "default_partition_groups")]
    pub partition_groups: usize,

    /// Maximum time a single poll may wait for records (default: 500ms).
    #[serde(default = "default_poll_max_wait_ms")]
    pub poll_max_wait_ms: u64,

    /// Maximum records returned by a single poll (default: 500).
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    /// Upper bound on bytes per fetch request (default: 1MB).
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,

    #[serde(default)]
    pub start_offset: StartOffset,

    /// Initial retry delay after the source becomes unavailable (default: 100ms).
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Cap on the retry delay (default: 5000ms).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Load generator settings, used when `kind` is `synthetic`.
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

impl SourceConfig {
    /// Partitions assigned to each poll worker, round-robin.
    pub fn assignments(&self) -> Vec<Vec<i32>> {
        let groups = self.partition_groups.clamp(1, self.partitions.len().max(1));
        let mut assigned = vec![Vec::new(); groups];
        for (i, partition) in self.partitions.iter().enumerate() {
            assigned[i % groups].push(*partition);
        }
        assigned
    }
}

fn default_partitions() -> Vec<i32> {
    vec![0]
}

fn default_partition_groups() -> usize {
    1
}

fn default_poll_max_wait_ms() -> u64 {
    500
}

fn default_max_poll_records() -> usize {
    500
}

fn default_fetch_max_bytes() -> i32 {
    MB as i32
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    5000
}

/// Synthetic load generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Total messages to produce; unbounded when unset.
    #[serde(default = "default_message_count")]
    pub message_count: Option<u64>,

    /// Optional rate limit in messages per second.
    #[serde(default)]
    pub rate_per_sec: Option<u64>,

    /// Value of the `source` field in generated messages.
    #[serde(default = "default_synthetic_source_name")]
    pub source_name: String,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            message_count: default_message_count(),
            rate_per_sec: None,
            source_name: default_synthetic_source_name(),
        }
    }
}

fn default_message_count() -> Option<u64> {
    Some(1000)
}

fn default_synthetic_source_name() -> String {
    "performance-test".to_string()
}

/// Batch formation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush once the buffered payload reaches this many bytes (default: 1MB).
    #[serde(default = "default_batch_max_bytes")]
    pub max_bytes: usize,

    /// Flush once this many records are buffered (default: 500).
    #[serde(default = "default_batch_max_count")]
    pub max_count: usize,

    /// Flush once the oldest buffered record is this old (default: 1000ms).
    #[serde(default = "default_batch_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_batch_max_bytes(),
            max_count: default_batch_max_count(),
            max_age_ms: default_batch_max_age_ms(),
        }
    }
}

fn default_batch_max_bytes() -> usize {
    MB
}

fn default_batch_max_count() -> usize {
    500
}

fn default_batch_max_age_ms() -> u64 {
    1000
}

/// Which warehouse client the sink talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    BigQuery,
    Mock,
}

/// What to do when a batch fails permanently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// End the run as failed.
    #[default]
    Abort,
    /// Record the batch to the DLQ and keep going.
    Skip,
}

/// Sink configuration for appending to the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Project owning the dataset (required for BigQuery).
    #[serde(default)]
    pub project_id: String,

    pub dataset: String,

    pub table: String,

    #[serde(default)]
    pub bigquery: BigQueryConfig,

    #[serde(default)]
    pub mock: MockConfig,

    /// Attempts per batch including the first (default: 3).
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// First retry delay (default: 100ms).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap on the retry delay (default: 1000ms).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    1000
}

/// How requests to BigQuery are authenticated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BigQueryAuth {
    /// `access_token` when set, Google credentials otherwise.
    #[default]
    Auto,
    /// Always send `access_token`.
    Token,
    /// Google credentials from `credentials_path` or the environment.
    Google,
    /// No authorization header, for emulators.
    None,
}

/// BigQuery streaming insert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    /// API root (default: `https://bigquery.googleapis.com`).
    #[serde(default = "default_bigquery_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub auth: BigQueryAuth,

    /// OAuth bearer token. Usually supplied as `${BIGQUERY_TOKEN}`.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Service account key or authorized user file. Falls back to
    /// `GOOGLE_APPLICATION_CREDENTIALS` and the gcloud default file.
    #[serde(default)]
    pub credentials_path: Option<String>,

    /// Accept the valid rows of a request that contains invalid ones (default: true).
    #[serde(default = "default_true")]
    pub skip_invalid_rows: bool,

    #[serde(default)]
    pub ignore_unknown_values: bool,

    /// Per-request timeout (default: 30s).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_bigquery_endpoint(),
            auth: BigQueryAuth::default(),
            access_token: None,
            credentials_path: None,
            skip_invalid_rows: default_true(),
            ignore_unknown_values: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bigquery_endpoint() -> String {
    "https://bigquery.googleapis.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// In-memory warehouse settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency per insert call.
    #[serde(default)]
    pub latency_ms: u64,
}

/// Concurrency and shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Batches allowed inside the sink at once (default: 4).
    #[serde(default = "default_max_in_flight_batches")]
    pub max_in_flight_batches: usize,

    /// Formed batches allowed to wait for a permit before polling slows down (default: 16).
    #[serde(default = "default_max_buffered_batches")]
    pub max_buffered_batches: usize,

    /// How long draining may take before in-flight batches are abandoned (default: 30s).
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight_batches: default_max_in_flight_batches(),
            max_buffered_batches: default_max_buffered_batches(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_max_in_flight_batches() -> usize {
    4
}

fn default_max_buffered_batches() -> usize {
    16
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Location of checkpoint documents (default: `memory://`, lost on exit).
    #[serde(default = "default_checkpoint_path")]
    pub path: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Interval between checkpoint writes (default: 5s).
    #[serde(default = "default_checkpoint_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            storage_options: HashMap::new(),
            interval_secs: default_checkpoint_interval_secs(),
        }
    }
}

fn default_checkpoint_path() -> String {
    "memory://".to_string()
}

fn default_checkpoint_interval_secs() -> u64 {
    5
}

/// Metrics configuration for the Prometheus endpoint and the in-process collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus endpoint is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
    /// Sliding window for throughput and latency quantiles (default: 60s).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Interval between performance reports in the log (default: 60s).
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
            window_secs: default_window_secs(),
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_window_secs() -> u64 {
    60
}

fn default_report_interval_secs() -> u64 {
    60
}

/// Error handling configuration for resilient pipeline execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Maximum failures before stopping pipeline (0 = unlimited, default: 0).
    #[serde(default)]
    pub max_failures: usize,
    /// Path to write dead letters (rejected rows, failed and abandoned batches).
    #[serde(default)]
    pub dlq_path: Option<String>,
    /// Storage options for DLQ (credentials, region, etc.)
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

/// The tuning knobs a run can be started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub batch_max_bytes: usize,
    pub batch_max_count: usize,
    pub batch_max_age_ms: u64,
    pub max_in_flight_batches: usize,
    pub max_retry_attempts: u32,
    pub drain_timeout_ms: u64,
}

impl RunOptions {
    /// Reject values that would stall or disable the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("batch_max_bytes", self.batch_max_bytes as u64)?;
        positive("batch_max_count", self.batch_max_count as u64)?;
        positive("batch_max_age_ms", self.batch_max_age_ms)?;
        positive("max_in_flight_batches", self.max_in_flight_batches as u64)?;
        positive("max_retry_attempts", self.max_retry_attempts as u64)?;
        positive("drain_timeout_ms", self.drain_timeout_ms)?;
        Ok(())
    }

    pub fn batch_max_age(&self) -> Duration {
        Duration::from_millis(self.batch_max_age_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn positive(name: &str, value: u64) -> Result<(), ConfigError> {
    ensure!(
        value > 0,
        ConfigInvalidSnafu {
            name,
            reason: "must be greater than zero",
        }
    );
    Ok(())
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml_with_options(&content, interpolate_env)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_with_options(
        content: &str,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            let result = vars::interpolate(content);
            if !result.is_ok() {
                let error_msg = result.errors.join("\n");
                return EnvInterpolationSnafu { message: error_msg }.fail();
            }
            result.text
        } else {
            content.to_string()
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.source.topic.is_empty(), EmptyTopicSnafu);
        if self.source.kind == SourceKind::Kafka {
            ensure!(!self.source.brokers.is_empty(), EmptyBrokersSnafu);
        }
        ensure!(
            !self.sink.dataset.is_empty() && !self.sink.table.is_empty(),
            EmptyTableSnafu
        );
        if self.sink.kind == SinkKind::BigQuery {
            ensure!(
                !self.sink.project_id.is_empty(),
                ConfigInvalidSnafu {
                    name: "sink.project_id",
                    reason: "required for the bigquery sink",
                }
            );
            let bigquery = &self.sink.bigquery;
            ensure!(
                bigquery.auth != BigQueryAuth::Token
                    || bigquery.access_token.as_deref().is_some_and(|t| !t.is_empty()),
                ConfigInvalidSnafu {
                    name: "sink.bigquery.access_token",
                    reason: "required when auth is 'token'",
                }
            );
        }
        ensure!(
            !self.source.partitions.is_empty(),
            ConfigInvalidSnafu {
                name: "source.partitions",
                reason: "at least one partition is required",
            }
        );
        let mut seen = std::collections::BTreeSet::new();
        for &partition in &self.source.partitions {
            ensure!(
                partition >= 0,
                ConfigInvalidSnafu {
                    name: "source.partitions",
                    reason: format!("partition {partition} is negative"),
                }
            );
            ensure!(
                seen.insert(partition),
                ConfigInvalidSnafu {
                    name: "source.partitions",
                    reason: format!("partition {partition} is listed more than once"),
                }
            );
        }
        positive("source.partition_groups", self.source.partition_groups as u64)?;
        positive("source.max_poll_records", self.source.max_poll_records as u64)?;
        positive("source.poll_max_wait_ms", self.source.poll_max_wait_ms)?;
        positive(
            "pipeline.max_buffered_batches",
            self.pipeline.max_buffered_batches as u64,
        )?;
        positive("checkpoint.interval_secs", self.checkpoint.interval_secs)?;
        positive("metrics.window_secs", self.metrics.window_secs)?;
        self.run_options().validate()
    }

    /// The run options currently in effect.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            batch_max_bytes: self.batch.max_bytes,
            batch_max_count: self.batch.max_count,
            batch_max_age_ms: self.batch.max_age_ms,
            max_in_flight_batches: self.pipeline.max_in_flight_batches,
            max_retry_attempts: self.sink.max_retry_attempts,
            drain_timeout_ms: self.pipeline.drain_timeout_ms,
        }
    }

    /// Replace the run options, keeping everything else.
    pub fn with_run_options(mut self, options: RunOptions) -> Self {
        self.batch.max_bytes = options.batch_max_bytes;
        self.batch.max_count = options.batch_max_count;
        self.batch.max_age_ms = options.batch_max_age_ms;
        self.pipeline.max_in_flight_batches = options.max_in_flight_batches;
        self.sink.max_retry_attempts = options.max_retry_attempts;
        self.pipeline.drain_timeout_ms = options.drain_timeout_ms;
        self
    }
}
