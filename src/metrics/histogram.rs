//! Log-bucketed latency histogram.
//!
//! Values are stored in microseconds. Below 16µs every value has its own
//! bucket; above that each power of two is split into 16 linear sub-buckets,
//! which bounds the relative error of a quantile at 1/16.

use std::collections::BTreeMap;
use std::time::Duration;

const SUB_BUCKET_BITS: u32 = 4;
const SUB_BUCKETS: u64 = 1 << SUB_BUCKET_BITS;

fn bucket_index(value: u64) -> u16 {
    if value < SUB_BUCKETS {
        return value as u16;
    }
    let exp = 63 - value.leading_zeros();
    let sub = (value >> (exp - SUB_BUCKET_BITS)) & (SUB_BUCKETS - 1);
    ((exp - SUB_BUCKET_BITS + 1) as u64 * SUB_BUCKETS + sub) as u16
}

/// Inclusive lower bound and width of a bucket.
fn bucket_bounds(index: u16) -> (u64, u64) {
    let index = u64::from(index);
    if index < SUB_BUCKETS {
        return (index, 1);
    }
    let shift = (index / SUB_BUCKETS - 1) as u32;
    let sub = index % SUB_BUCKETS;
    ((SUB_BUCKETS + sub) << shift, 1 << shift)
}

#[derive(Debug, Clone, Default)]
pub struct LatencyHistogram {
    buckets: BTreeMap<u16, u64>,
    count: u64,
    sum: u128,
    min: u64,
    max: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        *self.buckets.entry(bucket_index(micros)).or_default() += 1;
        if self.count == 0 {
            self.min = micros;
            self.max = micros;
        } else {
            self.min = self.min.min(micros);
            self.max = self.max.max(micros);
        }
        self.count += 1;
        self.sum += u128::from(micros);
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        if other.count == 0 {
            return;
        }
        for (index, n) in &other.buckets {
            *self.buckets.entry(*index).or_default() += n;
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.min))
    }

    pub fn max(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.max))
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let mean = self.sum / u128::from(self.count);
        Some(Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    /// Value at quantile `q` in `[0, 1]`, using the nearest-rank method.
    ///
    /// The result is the midpoint of the bucket holding that rank, clamped
    /// to the observed min and max. The top rank is always the exact max.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.count as f64).ceil() as u64).clamp(1, self.count);
        if rank == self.count {
            return self.max();
        }

        let mut seen = 0;
        for (index, n) in &self.buckets {
            seen += n;
            if seen >= rank {
                let (lower, width) = bucket_bounds(*index);
                let mid = lower + width / 2;
                return Some(Duration::from_micros(mid.clamp(self.min, self.max)));
            }
        }
        self.max()
    }
}
