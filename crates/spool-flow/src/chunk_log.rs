//! Append-only, per-task chunk log.
//!
//! Each chunk is a write-once object at `tasks/{id}/chunks/{seq:010}.json`.
//! Appends use put-if-absent, which gives:
//! - **Idempotency**: re-appending an identical payload is a no-op success,
//!   so the orchestrator may retry appends at-least-once
//! - **Immutability**: a different payload at an existing sequence is a
//!   `Conflict`, never an overwrite
//! - **No gaps**: sequence `s > 0` is only accepted once `s - 1` exists
//!
//! Readers see whole objects only, so a partially written chunk is never
//! observable.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spool_core::{SpoolPaths, StorageBackend, TaskId, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::registry::TaskRegistry;

/// One immutable fragment of produced output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Owning task.
    pub task_id: TaskId,
    /// Zero-based position in the task output.
    pub sequence: u64,
    /// Text fragment.
    pub payload: String,
    /// When the chunk was first written.
    pub produced_at: DateTime<Utc>,
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The chunk was written.
    Written,
    /// An identical chunk already existed.
    AlreadyPresent,
}

/// Result of a cursor read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPage {
    /// Chunks with `sequence >= from_seq`, in order.
    pub chunks: Vec<Chunk>,
    /// True when the task is terminal and `chunks` reaches the end of the log.
    pub done: bool,
}

/// Chunk log over the storage substrate.
#[derive(Clone)]
pub struct ChunkLog {
    storage: Arc<dyn StorageBackend>,
    registry: TaskRegistry,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for ChunkLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkLog").finish_non_exhaustive()
    }
}

impl ChunkLog {
    /// Creates a chunk log. The registry is consulted for `done` flags.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, registry: TaskRegistry) -> Self {
        Self {
            storage,
            registry,
            metrics: FlowMetrics::new(),
        }
    }

    /// Appends a chunk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if a different payload exists at `sequence`
    /// or if `sequence - 1` has not been written.
    #[tracing::instrument(skip(self, task_id, payload), fields(task_id = %task_id))]
    pub async fn append(
        &self,
        task_id: &TaskId,
        sequence: u64,
        payload: &str,
    ) -> Result<AppendOutcome> {
        if sequence > 0
            && self
                .storage
                .head(&SpoolPaths::chunk(task_id, sequence - 1))
                .await?
                .is_none()
        {
            return Err(Error::conflict(format!(
                "task {task_id} chunk {sequence} would leave a gap at {}",
                sequence - 1
            )));
        }

        let chunk = Chunk {
            task_id: *task_id,
            sequence,
            payload: payload.to_string(),
            produced_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&chunk)
            .map(Bytes::from)
            .map_err(Error::serialization)?;

        let path = SpoolPaths::chunk(task_id, sequence);
        match self
            .storage
            .put(&path, bytes, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                self.metrics.record_chunk_append("written");
                Ok(AppendOutcome::Written)
            }
            WriteResult::PreconditionFailed { .. } => {
                let existing = self.load(&path).await?.ok_or_else(|| {
                    Error::storage(format!("chunk {path} vanished after conflict"))
                })?;
                if existing.payload == payload {
                    self.metrics.record_chunk_append("duplicate");
                    Ok(AppendOutcome::AlreadyPresent)
                } else {
                    self.metrics.record_chunk_append("conflict");
                    Err(Error::conflict(format!(
                        "task {task_id} chunk {sequence} already holds a different payload"
                    )))
                }
            }
        }
    }

    /// Reads chunks from `from_seq`, at most `limit` of them.
    ///
    /// The task status is read before the chunks, so `done == true`
    /// guarantees no chunk was written after the returned ones.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown task.
    pub async fn read(
        &self,
        task_id: &TaskId,
        from_seq: u64,
        limit: Option<usize>,
    ) -> Result<ChunkPage> {
        let terminal = self.registry.get(task_id).await?.is_terminal();

        let mut chunks = Vec::new();
        let mut sequence = from_seq;
        let mut truncated = false;
        loop {
            if limit.is_some_and(|max| chunks.len() >= max) {
                truncated = self
                    .storage
                    .head(&SpoolPaths::chunk(task_id, sequence))
                    .await?
                    .is_some();
                break;
            }
            match self.load(&SpoolPaths::chunk(task_id, sequence)).await? {
                Some(chunk) => chunks.push(chunk),
                None => break,
            }
            sequence += 1;
        }

        Ok(ChunkPage {
            chunks,
            done: terminal && !truncated,
        })
    }

    /// Returns every chunk of a task, in order, without consulting status.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn read_all(&self, task_id: &TaskId) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        let mut sequence = 0;
        while let Some(chunk) = self.load(&SpoolPaths::chunk(task_id, sequence)).await? {
            chunks.push(chunk);
            sequence += 1;
        }
        Ok(chunks)
    }

    /// Returns the number of contiguous chunks starting at sequence 0.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn count(&self, task_id: &TaskId) -> Result<u64> {
        let sequences: BTreeSet<u64> = self
            .storage
            .list(&SpoolPaths::chunks_prefix(task_id))
            .await?
            .iter()
            .filter_map(|meta| SpoolPaths::parse_chunk_sequence(&meta.path))
            .collect();

        let mut count = 0;
        for sequence in sequences {
            if sequence != count {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    async fn load(&self, path: &str) -> Result<Option<Chunk>> {
        match self.storage.get(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(Error::serialization),
            Err(spool_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
