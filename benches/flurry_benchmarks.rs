//! flurry benchmark suite.
//!
//! Benchmarks for key operations:
//! - Batch formation
//! - Record to warehouse row mapping
//! - Latency histogram recording and quantiles
//! - End-to-end pipeline throughput against the mock warehouse

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

mod bench_utils;

use flurry::batch::{BatchLimits, Batcher};
use flurry::checkpoint::ObjectCheckpointStore;
use flurry::config::Config;
use flurry::metrics::histogram::LatencyHistogram;
use flurry::pipeline::{PipelineParts, RunRegistry};
use flurry::sink::{MockWarehouse, to_row};
use flurry::source::{MemorySource, RecordSource};
use flurry::storage::StorageProvider;

/// Benchmarks for batch formation.
///
/// Measures how fast records are grouped under count and byte limits.
fn batching_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("batching");

    for max_count in [100, 500, 5000] {
        let records = bench_utils::generate_records(10_000, 4);
        let limits = BatchLimits {
            max_bytes: 1024 * 1024,
            max_count,
            max_age: Duration::from_secs(60),
        };

        group.throughput(Throughput::Elements(records.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("add", max_count),
            &records,
            |b, records| {
                b.iter(|| {
                    let mut batcher = Batcher::new(limits);
                    let mut batches = 0usize;
                    for record in records.iter().cloned() {
                        batches += usize::from(batcher.add(record).is_some());
                    }
                    while batcher.flush_now().is_some() {
                        batches += 1;
                    }
                    batches
                });
            },
        );
    }

    group.finish();
}

/// Benchmarks for mapping records to warehouse rows.
fn row_mapping_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_mapping");

    for size in [100, 1000, 10000] {
        let records = bench_utils::generate_records(size, 1);
        let inserted_at = chrono::Utc::now();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(
            BenchmarkId::new("to_row", size),
            &records,
            |b, records| {
                b.iter(|| {
                    records
                        .iter()
                        .map(|record| to_row("bench", record, inserted_at))
                        .count()
                });
            },
        );
    }

    group.finish();
}

/// Benchmarks for the latency histogram behind the metrics collector.
fn histogram_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency_histogram");
    let latencies = bench_utils::generate_latencies(100_000);

    group.throughput(Throughput::Elements(latencies.len() as u64));
    group.bench_function("record", |b| {
        b.iter(|| {
            let mut histogram = LatencyHistogram::new();
            for latency in &latencies {
                histogram.record(*latency);
            }
            histogram.count()
        });
    });

    let mut histogram = LatencyHistogram::new();
    for latency in &latencies {
        histogram.record(*latency);
    }
    group.bench_function("quantiles", |b| {
        b.iter(|| {
            [0.5, 0.95, 0.99]
                .map(|q| histogram.quantile(q))
                .into_iter()
                .flatten()
                .sum::<Duration>()
        });
    });

    group.finish();
}

fn pipeline_config(max_in_flight: usize) -> Config {
    let yaml = format!(
        r#"
source:
  topic: bench
  brokers: ["localhost:9092"]
  max_poll_records: 500

sink:
  kind: mock
  dataset: bench
  table: events

batch:
  max_count: 500

pipeline:
  max_in_flight_batches: {max_in_flight}

metrics:
  enabled: false
"#
    );
    // Benchmarks may panic on setup errors.
    Config::from_yaml_with_options(&yaml, false).unwrap()
}

async fn run_once(config: Config, payloads: &[bytes::Bytes]) -> u64 {
    let storage = StorageProvider::for_url_with_options("memory://", HashMap::new())
        .await
        .unwrap();
    let source = MemorySource::new(500).with_partition(0, payloads.iter().cloned());
    let parts = PipelineParts {
        sources: vec![Box::new(source) as Box<dyn RecordSource>],
        warehouse: Arc::new(MockWarehouse::new()),
        checkpoint_store: Arc::new(ObjectCheckpointStore::new(Arc::new(storage))),
        dlq: None,
    };

    let registry = RunRegistry::new();
    let id = registry.start_run_with(config, parts).await.unwrap();
    registry.wait(id).await.unwrap().stats.records_ingested
}

/// End-to-end throughput of a run over an in-memory topic.
fn pipeline_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);

    let runtime = Runtime::new().unwrap();
    let payloads = bench_utils::generate_payloads(20_000);

    for max_in_flight in [1, 4, 16] {
        group.throughput(Throughput::Elements(payloads.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("memory_to_mock", max_in_flight),
            &max_in_flight,
            |b, &max_in_flight| {
                b.to_async(&runtime)
                    .iter(|| run_once(pipeline_config(max_in_flight), &payloads));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    batching_benchmarks,
    row_mapping_benchmarks,
    histogram_benchmarks,
    pipeline_benchmarks
);
criterion_main!(benches);
