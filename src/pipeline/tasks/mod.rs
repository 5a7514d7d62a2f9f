//! Background tasks of a run.
//!
//! Poll workers feed batches to the dispatcher over a bounded channel; the
//! dispatcher runs them through the sink. Checkpoints and reports are
//! written by their own interval tasks.

mod commit;
mod dispatch;
mod poll;
mod report;

pub(super) use commit::CommitFlusher;
pub(super) use dispatch::{DispatchSettings, Dispatcher};
pub(super) use poll::{PollSettings, PollWorker};
pub(super) use report::{Reporter, log_snapshot};

/// Sleep until `deadline`, or forever without one.
async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
