//! In-process performance collector.
//!
//! Cumulative counters are plain atomics. Windowed figures live in a fixed
//! ring of one-second buckets, each behind its own small mutex; a bucket is
//! reset the first time it is touched in a new second, so stale data falls
//! out of the window without a background sweeper.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::histogram::LatencyHistogram;

/// Category of a counted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    SinkTransient,
    SinkPermanent,
    RowRejected,
    CommitFailure,
    Abandoned,
}

impl ErrorKind {
    const ALL: [ErrorKind; 6] = [
        ErrorKind::SourceUnavailable,
        ErrorKind::SinkTransient,
        ErrorKind::SinkPermanent,
        ErrorKind::RowRejected,
        ErrorKind::CommitFailure,
        ErrorKind::Abandoned,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// One observation fed to the collector.
#[derive(Debug, Clone, Copy)]
pub struct MetricSample {
    pub timestamp: Instant,
    pub batch_latency: Duration,
    pub record_count: u64,
    pub error: Option<ErrorKind>,
}

impl MetricSample {
    /// A batch acknowledged after `latency`.
    pub fn batch(latency: Duration, record_count: u64) -> Self {
        Self {
            timestamp: Instant::now(),
            batch_latency: latency,
            record_count,
            error: None,
        }
    }

    /// A single failure of the given kind.
    pub fn error(kind: ErrorKind) -> Self {
        Self {
            timestamp: Instant::now(),
            batch_latency: Duration::ZERO,
            record_count: 0,
            error: Some(kind),
        }
    }
}

/// Batch latency figures over the window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

impl LatencySummary {
    fn from_histogram(histogram: &LatencyHistogram) -> Self {
        let ms = |d: Option<Duration>| d.map_or(0.0, |d| d.as_secs_f64() * 1000.0);
        Self {
            p50_ms: ms(histogram.quantile(0.50)),
            p95_ms: ms(histogram.quantile(0.95)),
            p99_ms: ms(histogram.quantile(0.99)),
            min_ms: ms(histogram.min()),
            max_ms: ms(histogram.max()),
            mean_ms: ms(histogram.mean()),
        }
    }
}

/// Point-in-time view of a run's performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub total_records: u64,
    pub total_batches: u64,
    pub total_errors: u64,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub window_secs: u64,
    pub window_records: u64,
    pub window_batches: u64,
    /// Records per second over the window.
    pub throughput: f64,
    /// Records per second since the collector started.
    pub overall_throughput: f64,
    pub latency: LatencySummary,
    /// Last read offset minus committed offset, per partition.
    pub commit_lag: BTreeMap<i32, i64>,
}

#[derive(Debug, Default)]
struct Bucket {
    second: u64,
    records: u64,
    batches: u64,
    latencies: LatencyHistogram,
}

impl Bucket {
    fn roll(&mut self, second: u64) {
        if self.second != second {
            self.second = second;
            self.records = 0;
            self.batches = 0;
            self.latencies.clear();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionProgress {
    first_read: i64,
    last_read: i64,
    committed: Option<i64>,
}

impl PartitionProgress {
    fn lag(&self) -> i64 {
        let committed = self.committed.unwrap_or(self.first_read - 1);
        (self.last_read - committed).max(0)
    }
}

#[derive(Debug)]
pub struct MetricsCollector {
    started: Instant,
    window_secs: u64,
    records: AtomicU64,
    batches: AtomicU64,
    errors: [AtomicU64; ErrorKind::ALL.len()],
    buckets: Vec<Mutex<Bucket>>,
    partitions: Mutex<BTreeMap<i32, PartitionProgress>>,
}

impl MetricsCollector {
    pub fn new(window: Duration) -> Self {
        let window_secs = window.as_secs().max(1);
        Self {
            started: Instant::now(),
            window_secs,
            records: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            errors: Default::default(),
            buckets: (0..window_secs).map(|_| Mutex::default()).collect(),
            partitions: Mutex::default(),
        }
    }

    pub fn record(&self, sample: MetricSample) {
        if let Some(kind) = sample.error {
            self.record_errors(kind, 1);
            return;
        }

        self.records.fetch_add(sample.record_count, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);

        let second = self.second_of(sample.timestamp);
        let mut bucket = lock(&self.buckets[(second % self.window_secs) as usize]);
        // A sample older than the bucket's current second has already left the window.
        if second < bucket.second {
            return;
        }
        bucket.roll(second);
        bucket.records += sample.record_count;
        bucket.batches += 1;
        bucket.latencies.record(sample.batch_latency);
    }

    pub fn record_errors(&self, kind: ErrorKind, count: u64) {
        self.errors[kind.slot()].fetch_add(count, Ordering::Relaxed);
    }

    /// Note the highest offset handed out by the source for a partition.
    pub fn observe_read(&self, partition: i32, offset: i64) {
        let mut partitions = lock(&self.partitions);
        partitions
            .entry(partition)
            .and_modify(|p| p.last_read = p.last_read.max(offset))
            .or_insert(PartitionProgress {
                first_read: offset,
                last_read: offset,
                committed: None,
            });
    }

    /// Note a committed offset for a partition.
    pub fn observe_committed(&self, partition: i32, offset: i64) {
        let mut partitions = lock(&self.partitions);
        let progress = partitions.entry(partition).or_insert(PartitionProgress {
            first_read: offset + 1,
            last_read: offset,
            committed: None,
        });
        progress.committed = Some(progress.committed.map_or(offset, |c| c.max(offset)));
    }

    pub fn total_records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.started);
        let current = elapsed.as_secs();

        let mut window_records = 0;
        let mut window_batches = 0;
        let mut latencies = LatencyHistogram::new();
        for bucket in &self.buckets {
            let bucket = lock(bucket);
            if bucket.second <= current && current - bucket.second < self.window_secs {
                window_records += bucket.records;
                window_batches += bucket.batches;
                latencies.merge(&bucket.latencies);
            }
        }

        let errors: BTreeMap<ErrorKind, u64> = ErrorKind::ALL
            .iter()
            .map(|kind| (*kind, self.errors[kind.slot()].load(Ordering::Relaxed)))
            .filter(|(_, n)| *n > 0)
            .collect();

        let commit_lag = lock(&self.partitions)
            .iter()
            .map(|(partition, progress)| (*partition, progress.lag()))
            .collect();

        let total_records = self.records.load(Ordering::Relaxed);
        let elapsed_secs = elapsed.as_secs_f64();
        let window_span = elapsed_secs.min(self.window_secs as f64);

        MetricsSnapshot {
            taken_at: Some(Utc::now()),
            elapsed_secs,
            total_records,
            total_batches: self.batches.load(Ordering::Relaxed),
            total_errors: errors.values().sum(),
            errors,
            window_secs: self.window_secs,
            window_records,
            window_batches,
            throughput: per_second(window_records, window_span),
            overall_throughput: per_second(total_records, elapsed_secs),
            latency: LatencySummary::from_histogram(&latencies),
            commit_lag,
        }
    }

    fn second_of(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.started).as_secs()
    }
}

fn per_second(count: u64, secs: f64) -> f64 {
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// Lock a collector mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Metrics lock poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_totals_and_latency() {
        let collector = MetricsCollector::new(Duration::from_secs(60));
        collector.record(MetricSample::batch(ms(10), 100));
        collector.record(MetricSample::batch(ms(20), 100));
        collector.record(MetricSample::batch(ms(30), 50));
        collector.record(MetricSample::error(ErrorKind::SinkTransient));

        tokio::time::advance(Duration::from_secs(5)).await;
        let snapshot = collector.snapshot();

        assert_eq!(snapshot.total_records, 250);
        assert_eq!(snapshot.total_batches, 3);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.errors[&ErrorKind::SinkTransient], 1);
        assert_eq!(snapshot.window_records, 250);
        assert_eq!(snapshot.throughput, 50.0);
        assert_eq!(snapshot.latency.min_ms, 10.0);
        assert_eq!(snapshot.latency.max_ms, 30.0);
        assert_eq!(snapshot.latency.mean_ms, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_buckets_leave_the_window() {
        let collector = MetricsCollector::new(Duration::from_secs(10));
        collector.record(MetricSample::batch(ms(500), 40));

        tokio::time::advance(Duration::from_secs(12)).await;
        collector.record(MetricSample::batch(ms(5), 10));
        let snapshot = collector.snapshot();

        assert_eq!(snapshot.total_records, 50);
        assert_eq!(snapshot.window_records, 10);
        assert_eq!(snapshot.window_batches, 1);
        assert_eq!(snapshot.latency.max_ms, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_bucket_is_reset() {
        let collector = MetricsCollector::new(Duration::from_secs(4));
        collector.record(MetricSample::batch(ms(100), 7));

        // Second 4 maps onto the same slot as second 0.
        tokio::time::advance(Duration::from_secs(4)).await;
        collector.record(MetricSample::batch(ms(1), 3));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.window_records, 3);
        assert_eq!(snapshot.latency.max_ms, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_totals_never_decrease() {
        let collector = Arc::new(MetricsCollector::new(Duration::from_secs(3)));
        let mut last = collector.snapshot();

        for round in 0..20u64 {
            collector.record(MetricSample::batch(ms(round + 1), round));
            if round % 3 == 0 {
                collector.record(MetricSample::error(ErrorKind::RowRejected));
            }
            tokio::time::advance(Duration::from_millis(700)).await;

            let next = collector.snapshot();
            assert!(next.total_records >= last.total_records);
            assert!(next.total_batches >= last.total_batches);
            assert!(next.total_errors >= last.total_errors);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_commit_lag() {
        let collector = MetricsCollector::new(Duration::from_secs(60));
        collector.observe_read(0, 10);
        collector.observe_read(0, 99);
        collector.observe_read(1, 5);
        collector.observe_committed(0, 49);

        let lag = collector.snapshot().commit_lag;
        assert_eq!(lag[&0], 50);
        // Nothing committed yet: every record read so far is outstanding.
        assert_eq!(lag[&1], 1);
    }

    #[tokio::test]
    async fn test_poisoned_bucket_is_recovered() {
        let collector = Arc::new(MetricsCollector::new(Duration::from_secs(60)));
        let poisoner = collector.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.buckets[0].lock().unwrap();
            panic!("poison the bucket");
        })
        .join();

        collector.record(MetricSample::batch(ms(1), 1));
        assert_eq!(collector.snapshot().window_records, 1);
    }
}
