//! Checkpoint persistence.

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;

use crate::error::{
    CheckpointError, CheckpointJsonSnafu, CheckpointLoadSnafu, CommitFailureSnafu,
};
use crate::storage::StorageProviderRef;

use super::CheckpointState;

/// Durable home of checkpoint documents, one per topic.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint of `topic`, or `None` if it was never written.
    async fn load(&self, topic: &str) -> Result<Option<CheckpointState>, CheckpointError>;

    /// Replace the checkpoint of `state.topic`.
    async fn save(&self, state: &CheckpointState) -> Result<(), CheckpointError>;
}

/// Stores each topic's checkpoint as `{topic}/checkpoint.json`.
#[derive(Debug, Clone)]
pub struct ObjectCheckpointStore {
    storage: StorageProviderRef,
}

impl ObjectCheckpointStore {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    fn path(topic: &str) -> String {
        format!("{topic}/checkpoint.json")
    }
}

#[async_trait]
impl CheckpointStore for ObjectCheckpointStore {
    async fn load(&self, topic: &str) -> Result<Option<CheckpointState>, CheckpointError> {
        let bytes = match self.storage.get(Self::path(topic)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => {
                return Err(source).context(CheckpointLoadSnafu { topic });
            }
        };

        let state = serde_json::from_slice(&bytes).context(CheckpointJsonSnafu)?;
        Ok(Some(state))
    }

    async fn save(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(state).context(CheckpointJsonSnafu)?;
        self.storage
            .put(Self::path(&state.topic), Bytes::from(json))
            .await
            .context(CommitFailureSnafu {
                topic: state.topic.as_str(),
            })
    }
}
