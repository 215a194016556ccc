//! Task records and the task status state machine.
//!
//! This module provides:
//! - `TaskStatus`: The pipeline state machine
//! - `GenerationParams`: The normalized request a task executes
//! - `Task`: The durable task record
//! - `StatusUpdate`: A validated change to a task record
//! - `TaskError`: Error information recorded on failed tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spool_core::TaskId;

use crate::error::{Error, Result};

/// Task pipeline state machine.
///
/// ```text
/// ┌─────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌───────────┐
/// │ CREATED │──►│ VALIDATING │──►│ GENERATING │──►│ PERSISTING │──►│ COMPLETED │
/// └─────────┘   └────────────┘   └────────────┘   └────────────┘   └───────────┘
///      │              │                │                │
///      └──────────────┴────────┬───────┴────────────────┘
///                              ▼
///                   ┌────────┐   ┌───────────┐
///                   │ FAILED │   │ CANCELLED │
///                   └────────┘   └───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Recorded, not yet picked up by a worker.
    #[default]
    Created,
    /// Request validation in progress.
    Validating,
    /// Waiting on the generation provider.
    Generating,
    /// Writing chunks to the chunk log.
    Persisting,
    /// All chunks persisted.
    Completed,
    /// Failed with a recorded error.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Created => matches!(target, Self::Validating | Self::Failed | Self::Cancelled),
            Self::Validating => {
                matches!(target, Self::Generating | Self::Failed | Self::Cancelled)
            }
            Self::Generating => {
                matches!(target, Self::Persisting | Self::Failed | Self::Cancelled)
            }
            Self::Persisting => {
                matches!(target, Self::Completed | Self::Failed | Self::Cancelled)
            }
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns all valid target states from the current state.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Created => vec![Self::Validating, Self::Failed, Self::Cancelled],
            Self::Validating => vec![Self::Generating, Self::Failed, Self::Cancelled],
            Self::Generating => vec![Self::Persisting, Self::Failed, Self::Cancelled],
            Self::Persisting => vec![Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::Generating => "generating",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Validating => write!(f, "VALIDATING"),
            Self::Generating => write!(f, "GENERATING"),
            Self::Persisting => write!(f, "PERSISTING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Pipeline step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    /// Request validation and provider preflight.
    Validate,
    /// Text generation.
    Generate,
    /// Chunk persistence.
    Persist,
}

impl TaskStep {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Generate => "generate",
            Self::Persist => "persist",
        }
    }
}

impl std::fmt::Display for TaskStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Task error information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    /// Error kind (see [`Error::kind`]).
    pub kind: String,
    /// Error message.
    pub message: String,
    /// Step that failed, if the failure came from a pipeline step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<TaskStep>,
    /// Attempts made before giving up.
    #[serde(default)]
    pub attempts: u32,
}

impl TaskError {
    /// Creates a task error from an engine error.
    #[must_use]
    pub fn from_error(error: &Error, step: Option<TaskStep>, attempts: u32) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            step,
            attempts,
        }
    }
}

/// The normalized generation request a task executes.
///
/// Temperature is stored in milli-units so the record (and the request
/// fingerprint) never contains floats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    /// Prompt text, trimmed.
    pub prompt: String,
    /// Provider selector, lowercase.
    pub provider: String,
    /// Resolved model name.
    pub model: String,
    /// Sampling temperature in thousandths.
    pub temperature_milli: u32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

impl GenerationParams {
    /// Returns the temperature as a float for provider APIs.
    #[must_use]
    pub fn temperature(&self) -> f64 {
        f64::from(self.temperature_milli) / 1000.0
    }
}

/// The durable task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task ID.
    pub id: TaskId,
    /// Fingerprint of the normalized request.
    pub fingerprint: String,
    /// Current pipeline status.
    pub status: TaskStatus,
    /// The request being executed.
    pub params: GenerationParams,
    /// Number of chunks durably persisted (next sequence to write).
    pub cursor: u64,
    /// Chunk count, known once generation is checkpointed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    /// Failure details for failed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Whether the task was satisfied from the result cache.
    #[serde(default)]
    pub cache_hit: bool,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task record last changed.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task in the `Created` state.
    #[must_use]
    pub fn new(id: TaskId, fingerprint: impl Into<String>, params: GenerationParams) -> Self {
        let now = Utc::now();
        Self {
            id,
            fingerprint: fingerprint.into(),
            status: TaskStatus::Created,
            params,
            cursor: 0,
            total_chunks: None,
            error: None,
            cache_hit: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates an already-completed task served from the result cache.
    #[must_use]
    pub fn from_cache(
        id: TaskId,
        fingerprint: impl Into<String>,
        params: GenerationParams,
        chunk_count: u64,
    ) -> Self {
        let mut task = Self::new(id, fingerprint, params);
        task.status = TaskStatus::Completed;
        task.cursor = chunk_count;
        task.total_chunks = Some(chunk_count);
        task.cache_hit = true;
        task
    }

    /// Returns true if the task has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a status update, enforcing the record invariants.
    ///
    /// - Status only moves along [`TaskStatus::can_transition_to`]; a
    ///   same-status update is allowed for non-terminal tasks (progress)
    /// - The cursor never decreases and never exceeds `total_chunks`
    /// - `total_chunks` is set once
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidStateTransition` for an illegal status change
    /// and `Error::Conflict` for cursor or chunk-count violations.
    #[tracing::instrument(
        skip(self, update),
        fields(task_id = %self.id, from = %self.status, to = %update.status)
    )]
    pub fn apply(&mut self, update: &StatusUpdate) -> Result<()> {
        let same = update.status == self.status;
        if (same && self.status.is_terminal())
            || (!same && !self.status.can_transition_to(update.status))
        {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: update.status.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.status,
                    self.status.valid_transitions()
                ),
            });
        }

        let total = match (self.total_chunks, update.total_chunks) {
            (Some(existing), Some(new)) if existing != new => {
                return Err(Error::conflict(format!(
                    "task {} total_chunks already {existing}, got {new}",
                    self.id
                )));
            }
            (existing, new) => new.or(existing),
        };

        let cursor = update.cursor.unwrap_or(self.cursor);
        if cursor < self.cursor {
            return Err(Error::conflict(format!(
                "task {} cursor may not decrease ({} -> {cursor})",
                self.id, self.cursor
            )));
        }
        if let Some(total) = total {
            if cursor > total {
                return Err(Error::conflict(format!(
                    "task {} cursor {cursor} exceeds total_chunks {total}",
                    self.id
                )));
            }
        }

        self.status = update.status;
        self.cursor = cursor;
        self.total_chunks = total;
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A requested change to a task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Target status.
    pub status: TaskStatus,
    /// New cursor, if it changed.
    pub cursor: Option<u64>,
    /// Error to record.
    pub error: Option<TaskError>,
    /// Chunk count, once known.
    pub total_chunks: Option<u64>,
}

impl StatusUpdate {
    /// Creates an update moving the task to `status`.
    #[must_use]
    pub const fn to(status: TaskStatus) -> Self {
        Self {
            status,
            cursor: None,
            error: None,
            total_chunks: None,
        }
    }

    /// Sets the cursor.
    #[must_use]
    pub const fn with_cursor(mut self, cursor: u64) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }

    /// Sets the chunk count.
    #[must_use]
    pub const fn with_total_chunks(mut self, total: u64) -> Self {
        self.total_chunks = Some(total);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GenerationParams {
        GenerationParams {
            prompt: "Hello".into(),
            provider: "echo".into(),
            model: "echo-1".into(),
            temperature_milli: 700,
            max_tokens: 4000,
        }
    }

    #[test]
    fn status_full_lifecycle() {
        let path = [
            TaskStatus::Created,
            TaskStatus::Validating,
            TaskStatus::Generating,
            TaskStatus::Persisting,
            TaskStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!TaskStatus::Created.can_transition_to(TaskStatus::Generating));
        assert!(!TaskStatus::Persisting.can_transition_to(TaskStatus::Validating));
    }

    #[test]
    fn failed_and_cancelled_reachable_from_any_non_terminal() {
        for status in [
            TaskStatus::Created,
            TaskStatus::Validating,
            TaskStatus::Generating,
            TaskStatus::Persisting,
        ] {
            assert!(status.can_transition_to(TaskStatus::Failed));
            assert!(status.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(status.valid_transitions().is_empty());
        }
    }

    #[test]
    fn completed_to_generating_is_rejected() {
        let mut task = Task::new(TaskId::generate(), "sha256:x", params());
        task.status = TaskStatus::Completed;
        let err = task
            .apply(&StatusUpdate::to(TaskStatus::Generating))
            .expect_err("illegal");
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn same_status_update_advances_cursor() -> Result<()> {
        let mut task = Task::new(TaskId::generate(), "sha256:x", params());
        task.apply(&StatusUpdate::to(TaskStatus::Validating))?;
        task.apply(&StatusUpdate::to(TaskStatus::Generating))?;
        task.apply(&StatusUpdate::to(TaskStatus::Persisting).with_total_chunks(2))?;
        task.apply(&StatusUpdate::to(TaskStatus::Persisting).with_cursor(1))?;
        assert_eq!(task.cursor, 1);
        assert_eq!(task.total_chunks, Some(2));
        Ok(())
    }

    #[test]
    fn cursor_never_decreases() -> Result<()> {
        let mut task = Task::new(TaskId::generate(), "sha256:x", params());
        task.apply(&StatusUpdate::to(TaskStatus::Validating))?;
        task.apply(&StatusUpdate::to(TaskStatus::Generating))?;
        task.apply(&StatusUpdate::to(TaskStatus::Persisting).with_cursor(2))?;
        let err = task
            .apply(&StatusUpdate::to(TaskStatus::Persisting).with_cursor(1))
            .expect_err("decrease");
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(task.cursor, 2);
        Ok(())
    }

    #[test]
    fn cursor_bounded_by_total_chunks() -> Result<()> {
        let mut task = Task::new(TaskId::generate(), "sha256:x", params());
        task.apply(&StatusUpdate::to(TaskStatus::Validating))?;
        task.apply(&StatusUpdate::to(TaskStatus::Generating))?;
        task.apply(&StatusUpdate::to(TaskStatus::Persisting).with_total_chunks(1))?;
        let err = task
            .apply(&StatusUpdate::to(TaskStatus::Persisting).with_cursor(2))
            .expect_err("beyond total");
        assert!(matches!(err, Error::Conflict { .. }));
        Ok(())
    }

    #[test]
    fn from_cache_is_completed() {
        let task = Task::from_cache(TaskId::generate(), "sha256:x", params(), 3);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.cursor, 3);
        assert!(task.cache_hit);
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Persisting).expect("serialize");
        assert_eq!(json, "\"PERSISTING\"");
    }

    #[test]
    fn temperature_converts_from_milli() {
        assert!((params().temperature() - 0.7).abs() < f64::EPSILON);
    }
}
