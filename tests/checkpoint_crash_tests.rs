//! Tests that restart the pipeline over a persisted checkpoint.
//!
//! Each test runs the pipeline against an on-disk checkpoint store, then
//! runs it again as a process restart would, and checks what the second
//! run reads and delivers.
//!
//! Run with: cargo test --test checkpoint_crash_tests

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use flurry::checkpoint::{CheckpointStore, ObjectCheckpointStore};
use flurry::config::Config;
use flurry::pipeline::{PipelineParts, PipelineState, RunRegistry, RunReport, RunStatus};
use flurry::sink::{MockFault, MockWarehouse};
use flurry::source::{MemorySource, RecordSource};
use flurry::storage::StorageProvider;

fn config() -> Config {
    let yaml = r#"
source:
  topic: events
  brokers: ["localhost:9092"]

sink:
  kind: mock
  dataset: ingest
  table: events
  initial_backoff_ms: 1

batch:
  max_count: 10

pipeline:
  max_in_flight_batches: 1

metrics:
  enabled: false
"#;
    Config::from_yaml_with_options(yaml, false).unwrap()
}

fn values(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!(r#"{{"n":{i}}}"#).into_bytes()).collect()
}

async fn checkpoint_store(dir: &Path) -> Arc<dyn CheckpointStore> {
    let storage = StorageProvider::for_url_with_options(dir.to_str().unwrap(), HashMap::new())
        .await
        .unwrap();
    Arc::new(ObjectCheckpointStore::new(Arc::new(storage)))
}

async fn run(
    dir: &Path,
    source: MemorySource,
    warehouse: &Arc<MockWarehouse>,
    config: Config,
) -> RunReport {
    let parts = PipelineParts {
        sources: vec![Box::new(source) as Box<dyn RecordSource>],
        warehouse: warehouse.clone(),
        checkpoint_store: checkpoint_store(dir).await,
        dlq: None,
    };
    let registry = RunRegistry::new();
    let id = registry.start_run_with(config, parts).await.unwrap();
    let report = registry.wait(id).await.unwrap();
    assert_eq!(registry.state(id).await.unwrap(), PipelineState::Stopped);
    report
}

fn read_checkpoint(dir: &Path) -> serde_json::Value {
    let content = std::fs::read_to_string(dir.join("events/checkpoint.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

/// A restarted run resumes one past the committed offset and delivers only
/// the records it has not delivered before.
#[tokio::test]
async fn test_restart_resumes_after_committed_offset() {
    let temp_dir = tempfile::TempDir::new().unwrap();

    let first = Arc::new(MockWarehouse::new());
    let report = run(
        temp_dir.path(),
        MemorySource::new(100).with_partition(0, values(50)),
        &first,
        config(),
    )
    .await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.committed, BTreeMap::from([(0, 49)]));

    // The topic grew by 30 records while the pipeline was down.
    let second = Arc::new(MockWarehouse::new());
    let report = run(
        temp_dir.path(),
        MemorySource::new(100).with_partition(0, values(80)),
        &second,
        config(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.records_polled, 30);
    let offsets: Vec<i64> = second.rows().iter().map(|row| row.offset).collect();
    assert_eq!(offsets, (50..80).collect::<Vec<_>>());
    assert_eq!(report.stats.committed, BTreeMap::from([(0, 79)]));
    assert_eq!(read_checkpoint(temp_dir.path())["partitions"]["0"], 79);
}

/// A batch that was never acknowledged is delivered again after a restart.
/// Rows carry the same insert ids both times, so the warehouse can drop the
/// duplicates.
#[tokio::test]
async fn test_unacknowledged_batch_is_replayed_after_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.push_fault(MockFault::Permanent);

    let report = run(
        temp_dir.path(),
        MemorySource::new(100).with_partition(0, values(30)),
        &warehouse,
        config(),
    )
    .await;
    assert!(matches!(report.status, RunStatus::Failed(_)));
    assert!(report.stats.committed.is_empty());
    let delivered_before_restart = warehouse.row_count();
    assert!(delivered_before_restart <= 20);

    let report = run(
        temp_dir.path(),
        MemorySource::new(100).with_partition(0, values(30)),
        &warehouse,
        config(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.records_polled, 30);
    assert_eq!(warehouse.row_count(), delivered_before_restart + 30);
    assert_eq!(warehouse.unique_row_count(), 30);
    assert_eq!(report.stats.committed, BTreeMap::from([(0, 29)]));
}

/// Restarting over a fully delivered topic delivers nothing and leaves the
/// checkpoint where it was.
#[tokio::test]
async fn test_restart_without_new_records_is_idempotent() {
    let temp_dir = tempfile::TempDir::new().unwrap();

    for _ in 0..2 {
        let warehouse = Arc::new(MockWarehouse::new());
        run(
            temp_dir.path(),
            MemorySource::new(100).with_partition(0, values(25)),
            &warehouse,
            config(),
        )
        .await;
    }

    let warehouse = Arc::new(MockWarehouse::new());
    let report = run(
        temp_dir.path(),
        MemorySource::new(100).with_partition(0, values(25)),
        &warehouse,
        config(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(warehouse.call_count(), 0);
    assert_eq!(report.stats.records_polled, 0);
    assert_eq!(report.stats.committed, BTreeMap::from([(0, 24)]));
    assert_eq!(read_checkpoint(temp_dir.path())["partitions"]["0"], 24);
}

/// The checkpoint document is versioned and keyed by topic and partition.
#[tokio::test]
async fn test_checkpoint_document_layout() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let warehouse = Arc::new(MockWarehouse::new());
    let source = MemorySource::new(100)
        .with_partition(0, values(12))
        .with_partition(3, values(5));

    let report = run(temp_dir.path(), source, &warehouse, config()).await;
    assert_eq!(report.status, RunStatus::Completed);

    let checkpoint = read_checkpoint(temp_dir.path());
    assert_eq!(checkpoint["schema_version"], 1);
    assert_eq!(checkpoint["topic"], "events");
    assert_eq!(checkpoint["partitions"]["0"], 11);
    assert_eq!(checkpoint["partitions"]["3"], 4);
    assert!(checkpoint["updated_at"].is_string());
}

/// A checkpoint that cannot be parsed stops the run before anything is
/// consumed, instead of silently starting over.
#[tokio::test]
async fn test_corrupted_checkpoint_fails_before_running() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(temp_dir.path().join("events")).unwrap();
    std::fs::write(
        temp_dir.path().join("events/checkpoint.json"),
        r#"{"schema_version": 1, "topic": "ev"#,
    )
    .unwrap();

    let warehouse = Arc::new(MockWarehouse::new());
    let report = run(
        temp_dir.path(),
        MemorySource::new(100).with_partition(0, values(10)),
        &warehouse,
        config(),
    )
    .await;

    match report.status {
        RunStatus::Failed(reason) => assert!(reason.contains("Checkpoint")),
        status => panic!("expected failure, got {status:?}"),
    }
    assert_eq!(warehouse.call_count(), 0);
    assert_eq!(report.snapshot.total_records, 0);
}

/// A checkpoint written in an unknown layout stops the run before anything
/// is read, rather than guessing at the offsets it holds.
#[tokio::test]
async fn test_unknown_checkpoint_schema_fails_the_run() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(temp_dir.path().join("events")).unwrap();
    std::fs::write(
        temp_dir.path().join("events/checkpoint.json"),
        r#"{"schema_version":99,"topic":"events","partitions":{"0":9},"updated_at":"2024-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    let warehouse = Arc::new(MockWarehouse::new());
    let report = run(
        temp_dir.path(),
        MemorySource::new(100).with_partition(0, values(20)),
        &warehouse,
        config(),
    )
    .await;

    assert!(
        matches!(report.status, RunStatus::Failed(ref reason) if reason.contains("schema version 99")),
        "{:?}",
        report.status
    );
    assert_eq!(report.stats.records_polled, 0);
    assert_eq!(warehouse.call_count(), 0);
    assert_eq!(read_checkpoint(temp_dir.path())["schema_version"], 99);
}
