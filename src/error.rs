//! Error types for flurry using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Topic name is empty.
    #[snafu(display("Source topic cannot be empty"))]
    EmptyTopic,

    /// Kafka source configured without brokers.
    #[snafu(display("Kafka source requires at least one broker"))]
    EmptyBrokers,

    /// Destination table is not fully specified.
    #[snafu(display("Sink table cannot be empty"))]
    EmptyTable,

    /// An option is outside its accepted range.
    #[snafu(display("Invalid configuration for '{name}': {reason}"))]
    ConfigInvalid { name: String, reason: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Source Errors ============

/// Errors raised while consuming from the topic.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The source cannot serve records right now.
    #[snafu(display("Source unavailable: {message}"))]
    Unavailable { message: String },

    /// A fetch against a partition leader failed.
    #[snafu(display("Kafka fetch failed for partition {partition}"))]
    KafkaFetch {
        partition: i32,
        source: rskafka::client::error::Error,
    },

    /// Connecting to the bootstrap brokers failed.
    #[snafu(display("Failed to connect to Kafka brokers"))]
    KafkaConnect {
        source: rskafka::client::error::Error,
    },
}

impl SourceError {
    /// Whether polling may be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Unavailable { .. } => true,
            SourceError::KafkaFetch { source, .. } => kafka_error_is_transient(source),
            SourceError::KafkaConnect { .. } => false,
        }
    }
}

/// Whether a Kafka client error can clear up without operator action.
///
/// Network trouble and leadership moves are retried; unknown topics,
/// authorization failures and malformed requests are not.
pub fn kafka_error_is_transient(error: &rskafka::client::error::Error) -> bool {
    use rskafka::client::error::{Error, ProtocolError};

    match error {
        Error::Connection(_) | Error::Request(_) | Error::RetryFailed(_) | Error::Timeout => true,
        Error::ServerError { protocol_error, .. } => matches!(
            protocol_error,
            ProtocolError::UnknownServerError
                | ProtocolError::CorruptMessage
                | ProtocolError::LeaderNotAvailable
                | ProtocolError::NotLeaderOrFollower
                | ProtocolError::RequestTimedOut
                | ProtocolError::BrokerNotAvailable
                | ProtocolError::ReplicaNotAvailable
                | ProtocolError::NetworkException
                | ProtocolError::NotEnoughReplicas
                | ProtocolError::KafkaStorageError
                | ProtocolError::FencedLeaderEpoch
                | ProtocolError::UnknownLeaderEpoch
                | ProtocolError::OffsetNotAvailable
                | ProtocolError::PreferredLeaderNotAvailable
                | ProtocolError::EligibleLeadersNotAvailable
                | ProtocolError::ThrottlingQuotaExceeded
        ),
        _ => false,
    }
}

// ============ Warehouse Errors ============

/// Whole-call failures reported by a warehouse client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// The call may succeed if repeated (throttling, 5xx, timeouts).
    #[snafu(display("Transient warehouse failure: {message}"))]
    WarehouseTransient { message: String },

    /// The call will never succeed as issued (auth, missing table, bad request).
    #[snafu(display("Permanent warehouse failure: {message}"))]
    WarehousePermanent { message: String },
}

impl WarehouseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WarehouseError::WarehouseTransient { .. })
    }
}

// ============ Sink Errors ============

/// Errors produced while appending a batch.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// A single attempt failed in a way that may be retried.
    #[snafu(display("Batch {batch_id} attempt {attempt} failed transiently"))]
    Transient {
        batch_id: u64,
        attempt: u32,
        source: WarehouseError,
    },

    /// The batch cannot be delivered.
    #[snafu(display("Batch {batch_id} failed permanently after {attempts} attempts: {reason}"))]
    Permanent {
        batch_id: u64,
        attempts: u32,
        reason: String,
    },
}

impl SinkError {
    pub fn batch_id(&self) -> u64 {
        match self {
            SinkError::Transient { batch_id, .. } | SinkError::Permanent { batch_id, .. } => {
                *batch_id
            }
        }
    }
}

// ============ Gate Errors ============

/// Errors from the admission gate.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GateError {
    /// The gate was closed while waiting for a permit.
    #[snafu(display("Admission gate is closed"))]
    GateClosed,
}

// ============ Checkpoint Errors ============

/// Errors that can occur while loading or persisting checkpoints.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Writing the checkpoint document failed.
    #[snafu(display("Failed to commit checkpoint for topic {topic}"))]
    CommitFailure { topic: String, source: StorageError },

    /// Reading the checkpoint document failed.
    #[snafu(display("Failed to load checkpoint for topic {topic}"))]
    CheckpointLoad { topic: String, source: StorageError },

    /// The checkpoint document could not be encoded or decoded.
    #[snafu(display("JSON error in checkpoint"))]
    CheckpointJson { source: serde_json::Error },

    /// The checkpoint was written in a layout this build does not read.
    #[snafu(display(
        "Checkpoint for topic {topic} has schema version {found}, expected {expected}"
    ))]
    UnsupportedSchema {
        topic: String,
        found: u32,
        expected: u32,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize a dead letter.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Storage error.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Source error.
    #[snafu(display("Source error"))]
    Source { source: SourceError },

    /// Checkpoint error.
    #[snafu(display("Checkpoint error"))]
    Checkpoint { source: CheckpointError },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// DLQ error.
    #[snafu(display("DLQ error"))]
    Dlq { source: DlqError },

    /// Max failures exceeded.
    #[snafu(display("Max failures exceeded: {count} failures"))]
    MaxFailuresExceeded { count: usize },

    /// No run is registered under the given id.
    #[snafu(display("Unknown run: {id}"))]
    UnknownRun { id: String },

    /// The run has not stopped yet.
    #[snafu(display("Run {id} is still active"))]
    RunActive { id: String },

    /// The task driving a run ended without producing a report.
    #[snafu(display("Run {id} ended without a report"))]
    RunAborted { id: String },

    /// A run finished with a failure.
    #[snafu(display("Run failed: {reason}"))]
    RunFailed { reason: String },
}
