//! Benchmark utilities for generating test data.

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;

use flurry::source::Record;

/// Generate message payloads shaped like the synthetic load generator's.
///
/// Each payload is a JSON object with an id, a message body of varying
/// length, a timestamp, a source and a priority.
pub fn generate_payloads(count: usize) -> Vec<Bytes> {
    let mut rng = rand::rng();
    let priorities = ["low", "normal", "high"];

    (0..count)
        .map(|i| {
            let body_len = rng.random_range(16..256);
            let body: String = (0..body_len)
                .map(|_| rng.random_range(b'a'..=b'z') as char)
                .collect();
            let priority = priorities[rng.random_range(0..priorities.len())];
            Bytes::from(format!(
                r#"{{"id":"msg-{i}","message":"{body}","timestamp":"{}","source":"bench","priority":"{priority}"}}"#,
                Utc::now().to_rfc3339()
            ))
        })
        .collect()
}

/// Generate records spread round-robin across `partitions`, with
/// consecutive offsets per partition.
pub fn generate_records(count: usize, partitions: i32) -> Vec<Record> {
    let partitions = partitions.max(1);
    generate_payloads(count)
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let i = i as i64;
            Record {
                partition: (i % i64::from(partitions)) as i32,
                offset: i / i64::from(partitions),
                key: Some(Bytes::from(format!("key-{}", i % 97))),
                value,
                timestamp: Utc::now(),
            }
        })
        .collect()
}

/// Generate latencies roughly log-normally spread between 1ms and 2s.
pub fn generate_latencies(count: usize) -> Vec<Duration> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let exponent: f64 = rng.random_range(0.0..11.0);
            Duration::from_micros((1000.0 * exponent.exp2()) as u64)
        })
        .collect()
}
