//! Dead Letter Queue for records that were not ingested.
//!
//! Rejected rows, permanently failed batches (skip policy) and batches
//! abandoned on drain are written as NDJSON to a configurable storage
//! location so they can be inspected and replayed from the topic.
//!
//! # Components
//!
//! - [`DeadLetterQueue`] - buffers dead letters and writes them out
//! - [`FailureTracker`] - counts failures with max_failures enforcement

mod queue;
mod tracker;
mod types;

pub use queue::DeadLetterQueue;
pub use tracker::FailureTracker;
pub use types::{DeadLetter, DeadLetterKind, FailureStats};
