//! Run-scoped context shared by every worker of a run.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::emit;
use crate::metrics::MetricsCollector;
use crate::metrics::events::RunStateChanged;

/// Lifecycle of a run. States only ever move forward; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a run within a [`RunRegistry`](super::RunRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handles a run's workers share: identity, cancellation, lifecycle state
/// and the metrics collector.
#[derive(Clone)]
pub struct RunContext {
    id: RunId,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<PipelineState>>,
    collector: Arc<MetricsCollector>,
}

impl RunContext {
    pub fn new(shutdown: CancellationToken, collector: Arc<MetricsCollector>) -> Self {
        let (state, _) = watch::channel(PipelineState::Created);
        Self {
            id: RunId::new(),
            shutdown,
            state: Arc::new(state),
            collector,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    /// Token cancelled when the run is asked to stop.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Move to `next` if it is ahead of the current state.
    ///
    /// Returns whether the state changed.
    pub fn transition(&self, next: PipelineState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Run {} is {}", self.id, next);
            emit!(RunStateChanged {
                state: next.as_str()
            });
        }
        changed
    }
}
