//! Per-task durable checkpoints outside the task record.
//!
//! - **Generation checkpoint**: the generated text, written once with
//!   put-if-absent. Its presence means the generator must never be called
//!   again for the task; the first writer wins and later writers adopt it.
//! - **Cancel request**: written by callers, read by the orchestrator at
//!   step boundaries.
//! - **Persist intent**: the sequence the orchestrator is about to append.
//!
//! The orchestrator writes the intent *then* reads the cancel request;
//! cancellation writes the request *then* reads the intent. Either the
//! orchestrator observes the request before appending, or the canceller
//! observes the intent, which bounds every chunk appended after the
//! cancellation was acknowledged.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use spool_core::{SpoolPaths, StorageBackend, TaskId, WritePrecondition, WriteResult};

use crate::error::{Error, Result};

/// The generated text of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationCheckpoint {
    /// Owning task.
    pub task_id: TaskId,
    /// The complete generated text.
    pub text: String,
    /// Provider that produced the text.
    pub provider: String,
    /// Model that produced the text.
    pub model: String,
    /// When the text was checkpointed.
    pub produced_at: DateTime<Utc>,
}

/// A caller's request to cancel a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    /// When cancellation was first requested.
    pub requested_at: DateTime<Utc>,
}

/// The chunk sequence the orchestrator is about to append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistIntent {
    /// Sequence about to be appended.
    pub sequence: u64,
}

/// Storage for checkpoints, cancel requests and persist intents.
#[derive(Clone)]
pub struct CheckpointStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Creates a checkpoint store.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Saves the generation checkpoint, or returns the one already saved.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn save_generation(
        &self,
        checkpoint: &GenerationCheckpoint,
    ) -> Result<GenerationCheckpoint> {
        let path = SpoolPaths::generation(&checkpoint.task_id);
        match self
            .storage
            .put(&path, encode(checkpoint)?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(checkpoint.clone()),
            WriteResult::PreconditionFailed { .. } => {
                tracing::debug!(task_id = %checkpoint.task_id, "adopting existing generation checkpoint");
                self.load(&path)
                    .await?
                    .ok_or_else(|| Error::storage(format!("{path} vanished after conflict")))
            }
        }
    }

    /// Loads the generation checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the checkpoint is corrupt.
    pub async fn load_generation(&self, task_id: &TaskId) -> Result<Option<GenerationCheckpoint>> {
        self.load(&SpoolPaths::generation(task_id)).await
    }

    /// Records a cancel request. Repeated requests keep the first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn request_cancel(&self, task_id: &TaskId) -> Result<()> {
        let request = CancelRequest {
            requested_at: Utc::now(),
        };
        self.storage
            .put(
                &SpoolPaths::cancel_request(task_id),
                encode(&request)?,
                WritePrecondition::DoesNotExist,
            )
            .await?;
        Ok(())
    }

    /// Loads the cancel request, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn cancel_request(&self, task_id: &TaskId) -> Result<Option<CancelRequest>> {
        self.load(&SpoolPaths::cancel_request(task_id)).await
    }

    /// Records the sequence about to be appended.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn write_intent(&self, task_id: &TaskId, sequence: u64) -> Result<()> {
        self.storage
            .put(
                &SpoolPaths::persist_intent(task_id),
                encode(&PersistIntent { sequence })?,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    /// Loads the last persist intent, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn intent(&self, task_id: &TaskId) -> Result<Option<PersistIntent>> {
        self.load(&SpoolPaths::persist_intent(task_id)).await
    }

    async fn load<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.storage.get(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(Error::serialization),
            Err(spool_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(Error::serialization)
}
