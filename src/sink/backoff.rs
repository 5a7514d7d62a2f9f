//! Exponential backoff with jitter.
//!
//! The schedule is an explicit value so it can be stepped in tests without
//! sleeping. Jitter only ever shortens a delay, so `max` stays a hard cap.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Source of jitter samples in `[0, 1)`.
pub trait Jitter: Send + Sync {
    fn sample(&self) -> f64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self) -> f64 {
        rand::rng().random_range(0.0..1.0)
    }
}

/// Always returns the same sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that may be removed at random.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    jitter: Arc<dyn Jitter>,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("policy", &self.policy)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_jitter(policy, Arc::new(RandomJitter))
    }

    pub fn with_jitter(policy: BackoffPolicy, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            policy,
            attempt: 0,
            jitter,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let base = self.policy.initial.as_secs_f64() * self.policy.multiplier.powi(exponent);
        let capped = base.min(self.policy.max.as_secs_f64());
        let shave = self.policy.jitter.clamp(0.0, 1.0) * self.jitter.sample();
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(capped * (1.0 - shave))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
