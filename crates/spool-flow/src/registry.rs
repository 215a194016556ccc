//! Durable task registry.
//!
//! Task records live at `tasks/{id}/record.json` and are only ever changed
//! by compare-and-swap against the version read alongside them, so
//! concurrent updaters cannot lose each other's writes.
//!
//! Non-terminal tasks are also indexed under `active/{id}`. The marker is
//! written before the record and removed after the terminal write, so a
//! crash can leave a stale marker but never an unindexed active task.
//! [`TaskRegistry::list_active`] filters and cleans stale markers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use spool_core::{SpoolPaths, StorageBackend, TaskId, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::task::{StatusUpdate, Task};

/// Attempts before a contended update gives up.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Age after which an active marker without a record is considered orphaned.
const ORPHAN_MARKER_GRACE: Duration = Duration::from_secs(60);

/// Durable store of task records.
#[derive(Clone)]
pub struct TaskRegistry {
    storage: Arc<dyn StorageBackend>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").finish_non_exhaustive()
    }
}

impl TaskRegistry {
    /// Creates a registry over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            metrics: FlowMetrics::new(),
        }
    }

    /// Creates a task record.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if a task with the same ID exists.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, status = %task.status))]
    pub async fn create(&self, task: &Task) -> Result<()> {
        if !task.is_terminal() {
            self.storage
                .put(
                    &SpoolPaths::active_marker(&task.id),
                    Bytes::from(task.id.to_string()),
                    WritePrecondition::None,
                )
                .await?;
        }

        match self
            .storage
            .put(
                &SpoolPaths::task_record(&task.id),
                encode(task)?,
                WritePrecondition::DoesNotExist,
            )
            .await?
        {
            WriteResult::Success { .. } => {
                self.metrics
                    .record_task_transition("none", task.status.as_label());
                Ok(())
            }
            WriteResult::PreconditionFailed { .. } => Err(Error::conflict(format!(
                "task {} already exists",
                task.id
            ))),
        }
    }

    /// Loads a task record.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown ID.
    pub async fn get(&self, task_id: &TaskId) -> Result<Task> {
        match self.storage.get(&SpoolPaths::task_record(task_id)).await {
            Ok(data) => decode(&data),
            Err(spool_core::Error::NotFound(_)) => Err(Error::TaskNotFound { task_id: *task_id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads a task record if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record is corrupt.
    pub async fn find(&self, task_id: &TaskId) -> Result<Option<Task>> {
        match self.get(task_id).await {
            Ok(task) => Ok(Some(task)),
            Err(Error::TaskNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Applies a status update with compare-and-swap.
    ///
    /// Returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown ID and `Error::Conflict`
    /// for an illegal transition, a decreasing cursor, or persistent
    /// contention.
    #[tracing::instrument(skip(self, update), fields(task_id = %task_id, to = %update.status))]
    pub async fn update_status(&self, task_id: &TaskId, update: StatusUpdate) -> Result<Task> {
        let path = SpoolPaths::task_record(task_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            // Version first, then contents: a newer body with an older
            // version just fails the CAS below and retries.
            let Some(meta) = self.storage.head(&path).await? else {
                return Err(Error::TaskNotFound { task_id: *task_id });
            };
            let mut task = self.get(task_id).await?;
            let from = task.status;

            task.apply(&update).map_err(|e| match e {
                Error::InvalidStateTransition { .. } => Error::conflict(e.to_string()),
                other => other,
            })?;

            match self
                .storage
                .put(
                    &path,
                    encode(&task)?,
                    WritePrecondition::MatchesVersion(meta.version),
                )
                .await?
            {
                WriteResult::Success { .. } => {
                    if from != task.status {
                        self.metrics
                            .record_task_transition(from.as_label(), task.status.as_label());
                        tracing::debug!(from = %from, to = %task.status, cursor = task.cursor, "task transitioned");
                    }
                    if task.is_terminal() {
                        self.storage
                            .delete(&SpoolPaths::active_marker(task_id))
                            .await?;
                    }
                    return Ok(task);
                }
                WriteResult::PreconditionFailed { .. } => {}
            }
        }

        Err(Error::conflict(format!(
            "task {task_id} update contended after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Returns all non-terminal tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list_active(&self) -> Result<Vec<Task>> {
        let mut markers = self.storage.list(SpoolPaths::active_prefix()).await?;
        markers.sort_by(|a, b| a.path.cmp(&b.path));

        let mut active = Vec::with_capacity(markers.len());
        for marker in markers {
            let Some(task_id) = SpoolPaths::parse_active_marker(&marker.path) else {
                continue;
            };
            match self.find(&task_id).await? {
                Some(task) if !task.is_terminal() => active.push(task),
                Some(_) => {
                    self.storage.delete(&marker.path).await?;
                }
                None => {
                    let orphaned = marker.last_modified.is_some_and(|at| {
                        (Utc::now() - at).to_std().unwrap_or_default() > ORPHAN_MARKER_GRACE
                    });
                    if orphaned {
                        tracing::warn!(task_id = %task_id, "removing orphaned active marker");
                        self.storage.delete(&marker.path).await?;
                    }
                }
            }
        }
        self.metrics.set_active_tasks(active.len());
        Ok(active)
    }

    /// Returns up to `limit` tasks of any status, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a record is unreadable.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Task>> {
        let objects = self.storage.list(SpoolPaths::tasks_prefix()).await?;
        let mut tasks = Vec::new();
        for task_id in objects
            .iter()
            .filter_map(|meta| SpoolPaths::parse_task_record(&meta.path))
        {
            if let Some(task) = self.find(&task_id).await? {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.to_string().cmp(&a.id.to_string()))
        });
        tasks.truncate(limit);
        Ok(tasks)
    }
}

fn encode(task: &Task) -> Result<Bytes> {
    serde_json::to_vec(task)
        .map(Bytes::from)
        .map_err(Error::serialization)
}

fn decode(data: &[u8]) -> Result<Task> {
    serde_json::from_slice(data).map_err(Error::serialization)
}
