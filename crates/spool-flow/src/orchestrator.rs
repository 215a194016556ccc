//! The task state machine driver.
//!
//! The orchestrator is the only component that decides task status. One
//! call to [`Orchestrator::drive`] takes the task lease, then loops: reload
//! the record, check for cancellation, run the step the status calls for,
//! record its durable outcome. Nothing survives between iterations except
//! what is in storage, so a worker that takes over a crashed worker's lease
//! resumes from exactly the same evidence:
//!
//! | Status | Evidence | Resumes at |
//! |--------|----------|------------|
//! | `Created` / `Validating` | none | validation |
//! | `Generating` | generation checkpoint | checkpoint adoption, no provider call |
//! | `Generating` | no checkpoint | generation |
//! | `Persisting` | checkpoint, `cursor`, chunk log | `max(cursor, contiguous chunks)` |
//!
//! While a drive runs, the lease is extended every third of its TTL. If an
//! extension is rejected the drive is abandoned without touching status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::Instrument;

use spool_core::observability::task_span;
use spool_core::{AcquireOutcome, Lease, LeaseManager, SpoolPaths, StorageBackend, TaskId, WorkerId};

use crate::cache::CacheIndex;
use crate::checkpoint::{CheckpointStore, GenerationCheckpoint};
use crate::chunk_log::ChunkLog;
use crate::chunking::Chunker;
use crate::error::{Error, Result};
use crate::generator::{GeneratorError, GeneratorRegistry};
use crate::metrics::FlowMetrics;
use crate::registry::TaskRegistry;
use crate::request::validate_params;
use crate::retry::{RetryPolicies, StepError, StepFailure};
use crate::task::{StatusUpdate, Task, TaskError, TaskStatus, TaskStep};

/// Result of one drive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The task reached (or already was in) a terminal status.
    Settled(TaskStatus),
    /// Another worker holds the task lease.
    Busy {
        /// Current lease holder.
        holder_id: String,
    },
    /// The lease was lost mid-drive; another worker will resume the task.
    LeaseLost,
}

/// Drives tasks through validation, generation and persistence.
#[derive(Clone)]
pub struct Orchestrator {
    registry: TaskRegistry,
    chunks: ChunkLog,
    checkpoints: CheckpointStore,
    cache: CacheIndex,
    generators: GeneratorRegistry,
    leases: LeaseManager,
    chunker: Chunker,
    retry: RetryPolicies,
    cache_ttl: Duration,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("generators", &self.generators)
            .field("chunker", &self.chunker)
            .field("retry", &self.retry)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

/// Components and settings an [`Orchestrator`] is assembled from.
#[derive(Debug, Clone)]
pub struct OrchestratorParts {
    /// Task records.
    pub registry: TaskRegistry,
    /// Chunk log.
    pub chunks: ChunkLog,
    /// Result cache.
    pub cache: CacheIndex,
    /// Providers.
    pub generators: GeneratorRegistry,
    /// Text splitter.
    pub chunker: Chunker,
    /// Per-step retry policies.
    pub retry: RetryPolicies,
    /// TTL of stored cache entries.
    pub cache_ttl: Duration,
    /// TTL of task leases.
    pub lease_ttl: Duration,
}

impl Orchestrator {
    /// Creates an orchestrator over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, parts: OrchestratorParts) -> Self {
        Self {
            registry: parts.registry,
            chunks: parts.chunks,
            checkpoints: CheckpointStore::new(Arc::clone(&storage)),
            cache: parts.cache,
            generators: parts.generators,
            leases: LeaseManager::new(storage, parts.lease_ttl),
            chunker: parts.chunker,
            retry: parts.retry,
            cache_ttl: parts.cache_ttl,
            metrics: FlowMetrics::new(),
        }
    }

    /// Drives a task as far as it goes while holding its lease.
    ///
    /// # Errors
    ///
    /// Returns an error when durable state cannot be read or written outside
    /// of a retried step. The task stays non-terminal and is picked up again
    /// by a later scan.
    pub async fn drive(&self, task_id: TaskId, worker: &WorkerId) -> Result<DriveOutcome> {
        let span = task_span("drive", &task_id.to_string(), worker.as_str());
        self.drive_leased(task_id, worker).instrument(span).await
    }

    async fn drive_leased(&self, task_id: TaskId, worker: &WorkerId) -> Result<DriveOutcome> {
        let mut lease = match self
            .leases
            .try_acquire(&SpoolPaths::task_lease(&task_id), worker)
            .await?
        {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::Held { holder_id } => {
                self.metrics.record_lease("held");
                return Ok(DriveOutcome::Busy { holder_id });
            }
        };
        self.metrics.record_lease("acquired");
        tracing::debug!(fencing = lease.fencing_token().sequence(), "task lease acquired");

        let outcome = {
            let run = self.run(task_id);
            let heartbeat = heartbeat(&mut lease);
            tokio::select! {
                result = run => result.map(DriveOutcome::Settled),
                lost = heartbeat => {
                    tracing::warn!(error = %lost, "task lease lost, abandoning drive");
                    self.metrics.record_lease("lost");
                    Ok(DriveOutcome::LeaseLost)
                }
            }
        };

        if !matches!(outcome, Ok(DriveOutcome::LeaseLost)) {
            if let Err(e) = lease.release().await {
                tracing::warn!(error = %e, "failed to release task lease");
            }
        }
        outcome
    }

    /// Runs the state machine until the task is terminal.
    async fn run(&self, task_id: TaskId) -> Result<TaskStatus> {
        loop {
            let task = self.registry.get(&task_id).await?;
            if task.is_terminal() {
                return Ok(task.status);
            }
            if self.cancel_requested(&task_id).await? {
                return self.settle_cancelled(&task).await;
            }

            match task.status {
                TaskStatus::Created => {
                    self.registry
                        .update_status(&task_id, StatusUpdate::to(TaskStatus::Validating))
                        .await?;
                }
                TaskStatus::Validating => {
                    if let Err(failure) = self.validate(&task).await {
                        return self.settle_failed(&task, TaskStep::Validate, failure).await;
                    }
                    self.registry
                        .update_status(&task_id, StatusUpdate::to(TaskStatus::Generating))
                        .await?;
                }
                TaskStatus::Generating => match self.generate(&task).await {
                    Ok(()) => {}
                    Err(Halt::Step(failure)) => {
                        return self.settle_failed(&task, TaskStep::Generate, failure).await;
                    }
                    Err(Halt::Abort(e)) => return Err(e),
                },
                TaskStatus::Persisting => match self.persist(&task).await {
                    Ok(()) => {}
                    Err(Halt::Step(failure)) => {
                        return self.settle_failed(&task, TaskStep::Persist, failure).await;
                    }
                    Err(Halt::Abort(e)) => return Err(e),
                },
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    return Ok(task.status);
                }
            }
        }
    }

    async fn validate(&self, task: &Task) -> std::result::Result<(), StepFailure> {
        let params = &task.params;
        let generators = &self.generators;
        self.retry
            .validate
            .run(TaskStep::Validate, &self.metrics, |_| async move {
                validate_params(params, generators).map_err(StepError::Fatal)?;
                let generator = generators.get(&params.provider).ok_or_else(|| {
                    StepError::Fatal(Error::validation(format!(
                        "unknown provider '{}'",
                        params.provider
                    )))
                })?;
                generator.preflight(params).await.map_err(provider_error)
            })
            .await
    }

    /// Produces the generation checkpoint and moves the task to `Persisting`.
    ///
    /// A checkpoint written by an earlier holder is adopted as-is. A fresh
    /// result that arrives after cancellation was requested is discarded.
    async fn generate(&self, task: &Task) -> std::result::Result<(), Halt> {
        let persist_policy = &self.retry.persist;
        let checkpoint = match self.checkpoints.load_generation(&task.id).await? {
            Some(checkpoint) => {
                tracing::info!("generation checkpoint found, skipping provider call");
                checkpoint
            }
            None => {
                let text = self.call_generator(task).await?;
                if self.cancel_requested(&task.id).await? {
                    tracing::info!("cancellation requested during generation, discarding result");
                    return Ok(());
                }
                let checkpoint = GenerationCheckpoint {
                    task_id: task.id,
                    text,
                    provider: task.params.provider.clone(),
                    model: task.params.model.clone(),
                    produced_at: Utc::now(),
                };
                let checkpoints = &self.checkpoints;
                let checkpoint = &checkpoint;
                persist_policy
                    .run(TaskStep::Generate, &self.metrics, |_| async move {
                        checkpoints
                            .save_generation(checkpoint)
                            .await
                            .map_err(StepError::from)
                    })
                    .await?
            }
        };

        let total = u64::try_from(self.chunker.split(&checkpoint.text).len()).unwrap_or(u64::MAX);
        self.registry
            .update_status(
                &task.id,
                StatusUpdate::to(TaskStatus::Persisting).with_total_chunks(total),
            )
            .await?;
        Ok(())
    }

    async fn call_generator(&self, task: &Task) -> std::result::Result<String, StepFailure> {
        let params = &task.params;
        let generator = self.generators.get(&params.provider).ok_or_else(|| StepFailure {
            error: Error::validation(format!("unknown provider '{}'", params.provider)),
            attempts: 0,
        })?;
        let generator = &generator;
        tracing::info!(provider = %params.provider, model = %params.model, "calling generator");
        self.retry
            .generate
            .run(TaskStep::Generate, &self.metrics, |attempt| async move {
                tracing::debug!(attempt, "generation attempt");
                generator.generate(params).await.map_err(provider_error)
            })
            .await
    }

    /// Appends every missing chunk, then completes the task.
    async fn persist(&self, task: &Task) -> std::result::Result<(), Halt> {
        let logged = self.chunks.count(&task.id).await?;
        let text = match self.checkpoints.load_generation(&task.id).await? {
            Some(checkpoint) => checkpoint.text,
            None => self.rebuild_text(task, logged).await?,
        };

        let payloads = self.chunker.split(&text);
        let total = u64::try_from(payloads.len()).unwrap_or(u64::MAX);
        if let Some(expected) = task.total_chunks.filter(|expected| *expected != total) {
            return Err(Halt::fatal(Error::conflict(format!(
                "checkpoint splits into {total} chunks but the task expects {expected}"
            ))));
        }

        let mut cursor = task.cursor.max(logged.min(total));
        if cursor > task.cursor {
            tracing::info!(from = task.cursor, to = cursor, "reconciling cursor with chunk log");
            self.advance_cursor(&task.id, cursor).await?;
        }

        let policy = &self.retry.persist;
        let chunks = &self.chunks;
        let checkpoints = &self.checkpoints;
        let task_id = task.id;
        while cursor < total {
            let sequence = cursor;
            policy
                .run(TaskStep::Persist, &self.metrics, |_| async move {
                    checkpoints
                        .write_intent(&task_id, sequence)
                        .await
                        .map_err(StepError::from)
                })
                .await?;
            if self.cancel_requested(&task_id).await? {
                return Ok(());
            }

            let payload = payloads
                .get(usize::try_from(sequence).unwrap_or(usize::MAX))
                .copied()
                .unwrap_or_default();
            policy
                .run(TaskStep::Persist, &self.metrics, |_| async move {
                    chunks
                        .append(&task_id, sequence, payload)
                        .await
                        .map_err(StepError::from)
                })
                .await?;

            cursor = sequence + 1;
            self.advance_cursor(&task_id, cursor).await?;
        }

        self.complete(task, &text).await
    }

    async fn rebuild_text(&self, task: &Task, logged: u64) -> std::result::Result<String, Halt> {
        match task.total_chunks {
            Some(total) if logged >= total => {
                tracing::info!("generation checkpoint missing, rebuilding text from chunk log");
                let chunks = self.chunks.read_all(&task.id).await?;
                Ok(chunks.into_iter().map(|c| c.payload).collect())
            }
            _ => Err(Halt::fatal(Error::persistence(format!(
                "task {} is persisting but its generation checkpoint is missing",
                task.id
            )))),
        }
    }

    async fn advance_cursor(&self, task_id: &TaskId, cursor: u64) -> Result<()> {
        self.registry
            .update_status(task_id, StatusUpdate::to(TaskStatus::Persisting).with_cursor(cursor))
            .await?;
        Ok(())
    }

    async fn complete(&self, task: &Task, text: &str) -> std::result::Result<(), Halt> {
        if let Err(e) = self.cache.store(&task.fingerprint, text, self.cache_ttl).await {
            tracing::warn!(error = %e, "failed to store cache entry, continuing without it");
        }
        self.registry
            .update_status(&task.id, StatusUpdate::to(TaskStatus::Completed))
            .await?;
        tracing::info!(chunks = task.total_chunks.unwrap_or_default(), "task completed");
        self.release_claim(task).await;
        Ok(())
    }

    async fn settle_failed(
        &self,
        task: &Task,
        step: TaskStep,
        failure: StepFailure,
    ) -> Result<TaskStatus> {
        tracing::error!(
            step = %step,
            attempts = failure.attempts,
            error = %failure.error,
            "task failed"
        );
        let error = TaskError::from_error(&failure.error, Some(step), failure.attempts);
        let updated = self
            .registry
            .update_status(
                &task.id,
                StatusUpdate::to(TaskStatus::Failed).with_error(error),
            )
            .await?;
        self.release_claim(task).await;
        Ok(updated.status)
    }

    async fn settle_cancelled(&self, task: &Task) -> Result<TaskStatus> {
        let logged = self.chunks.count(&task.id).await?;
        let cursor = task.cursor.max(logged);
        let updated = self
            .registry
            .update_status(
                &task.id,
                StatusUpdate::to(TaskStatus::Cancelled).with_cursor(cursor),
            )
            .await?;
        tracing::info!(cursor, "task cancelled");
        self.release_claim(task).await;
        Ok(updated.status)
    }

    async fn release_claim(&self, task: &Task) {
        if let Err(e) = self.cache.release_claim(&task.fingerprint, &task.id).await {
            tracing::warn!(error = %e, "failed to release single-flight claim");
        }
    }

    async fn cancel_requested(&self, task_id: &TaskId) -> Result<bool> {
        Ok(self.checkpoints.cancel_request(task_id).await?.is_some())
    }
}

/// Extends the lease every third of its TTL; returns once an extension is
/// rejected.
async fn heartbeat(lease: &mut Lease) -> spool_core::Error {
    let mut interval = tokio::time::interval((lease.ttl() / 3).max(Duration::from_millis(10)));
    interval.tick().await;
    loop {
        interval.tick().await;
        match lease.extend().await {
            Ok(()) => {}
            Err(e @ spool_core::Error::PreconditionFailed { .. }) => return e,
            Err(e) => tracing::warn!(error = %e, "lease extension failed, will retry"),
        }
    }
}

fn provider_error(err: GeneratorError) -> StepError {
    match err {
        GeneratorError::Transient(message) => StepError::Transient(Error::TransientProvider { message }),
        GeneratorError::Fatal(message) => {
            StepError::Fatal(Error::validation(format!("provider rejected request: {message}")))
        }
    }
}

/// Why a step stopped short.
enum Halt {
    /// The step failed; the task fails with this error.
    Step(StepFailure),
    /// Bookkeeping outside the step failed; the task is left for a later
    /// drive.
    Abort(Error),
}

impl Halt {
    fn fatal(error: Error) -> Self {
        Self::Step(StepFailure { error, attempts: 1 })
    }
}

impl From<StepFailure> for Halt {
    fn from(failure: StepFailure) -> Self {
        Self::Step(failure)
    }
}

impl From<Error> for Halt {
    fn from(error: Error) -> Self {
        Self::Abort(error)
    }
}
