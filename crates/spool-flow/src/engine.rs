//! Transport-agnostic boundary operations.
//!
//! [`Engine`] wires the registry, chunk log, cache and orchestrator over one
//! storage backend and exposes the operations clients use: submit, status,
//! chunk reads, cancellation and cache statistics. Nothing here decides task
//! status; submissions only create records for workers to drive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use spool_core::{LocalFsBackend, SpoolPaths, StorageBackend, TaskId};

use crate::cache::{CacheEntry, CacheIndex, CacheStats, ClaimOutcome};
use crate::checkpoint::{CheckpointStore, GenerationCheckpoint};
use crate::chunk_log::{ChunkLog, ChunkPage};
use crate::chunking::Chunker;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::generator::GeneratorRegistry;
use crate::orchestrator::{Orchestrator, OrchestratorParts};
use crate::registry::TaskRegistry;
use crate::request::GenerationRequest;
use crate::task::{GenerationParams, Task, TaskError, TaskStatus};
use crate::worker::WorkerPool;

/// Response to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// Task to follow.
    pub task_id: TaskId,
    /// Whether the result came from the cache.
    pub cache_hit: bool,
    /// Whether `task_id` belongs to an identical in-flight submission.
    pub joined: bool,
    /// The final text, for cache hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// A task's progress as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusReport {
    /// Task ID.
    pub task_id: TaskId,
    /// Pipeline status.
    pub status: TaskStatus,
    /// Chunks durably persisted.
    pub cursor: u64,
    /// Total chunks, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    /// Failure details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Whether the task was served from the cache.
    pub cache_hit: bool,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskStatusReport {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            cursor: task.cursor,
            total_chunks: task.total_chunks,
            error: task.error,
            cache_hit: task.cache_hit,
            updated_at: task.updated_at,
        }
    }
}

/// Response to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    /// False when the task was already terminal.
    pub accepted: bool,
    /// No chunk with a sequence at or beyond this will be appended.
    pub fence: u64,
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    /// Completed with the full text.
    Completed {
        /// Concatenated chunks.
        text: String,
    },
    /// Failed.
    Failed {
        /// Recorded failure.
        error: Option<TaskError>,
    },
    /// Cancelled.
    Cancelled {
        /// Chunks persisted before cancellation took effect.
        cursor: u64,
    },
}

/// The generation engine.
#[derive(Clone)]
pub struct Engine {
    storage: Arc<dyn StorageBackend>,
    registry: TaskRegistry,
    chunks: ChunkLog,
    checkpoints: CheckpointStore,
    cache: CacheIndex,
    generators: GeneratorRegistry,
    chunker: Chunker,
    orchestrator: Orchestrator,
    config: EngineConfig,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("generators", &self.generators)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the built-in providers.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for invalid configuration.
    pub fn new(storage: Arc<dyn StorageBackend>, config: EngineConfig) -> Result<Self> {
        let generators = config.generators()?;
        Self::with_generators(storage, config, generators)
    }

    /// Opens an engine over the local filesystem at `config.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// configuration is invalid.
    pub fn open_local(config: EngineConfig) -> Result<Self> {
        let storage = LocalFsBackend::open(config.data_dir.clone())?;
        Self::new(Arc::new(storage), config)
    }

    /// Creates an engine with a custom provider registry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for invalid configuration.
    pub fn with_generators(
        storage: Arc<dyn StorageBackend>,
        config: EngineConfig,
        generators: GeneratorRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = config.chunker()?;
        let registry = TaskRegistry::new(Arc::clone(&storage));
        let chunks = ChunkLog::new(Arc::clone(&storage), registry.clone());
        let cache = CacheIndex::new(Arc::clone(&storage), registry.clone())
            .with_claim_grace(config.claim_grace);
        let orchestrator = Orchestrator::new(
            Arc::clone(&storage),
            OrchestratorParts {
                registry: registry.clone(),
                chunks: chunks.clone(),
                cache: cache.clone(),
                generators: generators.clone(),
                chunker,
                retry: config.retry,
                cache_ttl: config.cache_ttl,
                lease_ttl: config.lease_ttl,
            },
        );
        Ok(Self {
            checkpoints: CheckpointStore::new(Arc::clone(&storage)),
            storage,
            registry,
            chunks,
            cache,
            generators,
            chunker,
            orchestrator,
            config,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Returns the task registry.
    #[must_use]
    pub const fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Builds a worker pool that is woken by this engine's submissions.
    #[must_use]
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.orchestrator.clone(),
            self.registry.clone(),
            self.config.worker_count,
            self.config.poll_interval,
            Arc::clone(&self.wake),
        )
    }

    /// Submits a request.
    ///
    /// A cache hit is recorded as a completed task whose chunks are
    /// materialized immediately. On a miss, the first submitter of a
    /// fingerprint creates the task; concurrent identical submissions are
    /// handed that task's ID with `joined = true`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if the caller-chosen task ID exists and
    /// `Error::Validation` if the request cannot be normalized.
    #[tracing::instrument(skip(self, request), fields(provider = %request.provider))]
    pub async fn submit(&self, request: GenerationRequest) -> Result<SubmitReceipt> {
        let params = request.normalize(&self.generators)?;
        let fingerprint = fingerprint(&params)?;
        let task_id = match request.task_id {
            Some(id) => {
                if self.registry.find(&id).await?.is_some() {
                    return Err(Error::conflict(format!("task {id} already exists")));
                }
                id
            }
            None => TaskId::generate(),
        };

        match self.cache.lookup(&fingerprint).await {
            Ok(Some(entry)) => return self.serve_cached(task_id, params, entry).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "cache unavailable, treating as miss"),
        }

        let single_flight = match self.cache.claim(&fingerprint, task_id).await {
            Ok(ClaimOutcome::Leader) => true,
            Ok(ClaimOutcome::Joined(owner)) => {
                tracing::info!(owner = %owner, "joined in-flight task");
                return Ok(SubmitReceipt {
                    task_id: owner,
                    cache_hit: false,
                    joined: true,
                    result: None,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "single-flight unavailable, generating independently");
                false
            }
        };

        let task = Task::new(task_id, fingerprint.clone(), params);
        if let Err(e) = self.registry.create(&task).await {
            if single_flight {
                if let Err(release) = self.cache.release_claim(&fingerprint, &task_id).await {
                    tracing::warn!(error = %release, "failed to release single-flight claim");
                }
            }
            return Err(e);
        }
        self.wake.notify_waiters();
        tracing::info!(task_id = %task_id, "task submitted");

        Ok(SubmitReceipt {
            task_id,
            cache_hit: false,
            joined: false,
            result: None,
        })
    }

    /// Records a cache hit as a completed task.
    ///
    /// The checkpoint and chunks are written before the task record so the
    /// record never points at missing chunks. If any write fails they are
    /// discarded again, unless the ID turned out to belong to another task.
    async fn serve_cached(
        &self,
        task_id: TaskId,
        params: GenerationParams,
        entry: CacheEntry,
    ) -> Result<SubmitReceipt> {
        if let Err(e) = self.materialize_cached(task_id, params, &entry).await {
            if !matches!(e, Error::Conflict { .. }) {
                self.discard(&task_id).await;
            }
            return Err(e);
        }
        tracing::info!(task_id = %task_id, "served from cache");

        Ok(SubmitReceipt {
            task_id,
            cache_hit: true,
            joined: false,
            result: Some(entry.final_text),
        })
    }

    async fn materialize_cached(
        &self,
        task_id: TaskId,
        params: GenerationParams,
        entry: &CacheEntry,
    ) -> Result<()> {
        self.checkpoints
            .save_generation(&GenerationCheckpoint {
                task_id,
                text: entry.final_text.clone(),
                provider: params.provider.clone(),
                model: params.model.clone(),
                produced_at: Utc::now(),
            })
            .await?;

        let payloads = self.chunker.split(&entry.final_text);
        for (sequence, payload) in (0_u64..).zip(&payloads) {
            self.chunks.append(&task_id, sequence, payload).await?;
        }

        let chunk_count = u64::try_from(payloads.len()).unwrap_or(u64::MAX);
        let task = Task::from_cache(task_id, entry.fingerprint.clone(), params, chunk_count);
        self.registry.create(&task).await
    }

    /// Best-effort removal of everything stored under a task that was never
    /// created.
    async fn discard(&self, task_id: &TaskId) {
        let objects = match self.storage.list(&SpoolPaths::task_prefix(task_id)).await {
            Ok(objects) => objects,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "failed to list orphaned task objects");
                return;
            }
        };
        for object in objects {
            if let Err(e) = self.storage.delete(&object.path).await {
                tracing::warn!(path = %object.path, error = %e, "failed to delete orphaned task object");
            }
        }
    }

    /// Submits several requests as one batch.
    ///
    /// Every request is normalized before any task is created, so a malformed
    /// request rejects the whole batch. Receipts come back in request order;
    /// identical requests within a batch share one generation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if any request cannot be normalized. A
    /// storage failure part way through leaves earlier requests submitted.
    #[tracing::instrument(skip(self, requests), fields(size = requests.len()))]
    pub async fn submit_batch(&self, requests: Vec<GenerationRequest>) -> Result<Vec<SubmitReceipt>> {
        for (index, request) in requests.iter().enumerate() {
            request.normalize(&self.generators).map_err(|e| match e {
                Error::Validation { message } => Error::validation(format!("request {index}: {message}")),
                other => other,
            })?;
        }

        let mut receipts = Vec::with_capacity(requests.len());
        for request in requests {
            receipts.push(self.submit(request).await?);
        }
        tracing::info!(submitted = receipts.len(), "batch submitted");
        Ok(receipts)
    }

    /// Returns up to `limit` tasks of any status, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskStatusReport>> {
        let tasks = self.registry.list_recent(limit).await?;
        Ok(tasks.into_iter().map(TaskStatusReport::from).collect())
    }

    /// Returns a task's status.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown ID.
    pub async fn get_status(&self, task_id: &TaskId) -> Result<TaskStatusReport> {
        Ok(self.registry.get(task_id).await?.into())
    }

    /// Returns every chunk from `from_seq` on.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown ID.
    pub async fn get_chunks(&self, task_id: &TaskId, from_seq: u64) -> Result<ChunkPage> {
        self.chunks.read(task_id, from_seq, None).await
    }

    /// Returns at most `limit` chunks from `from_seq` on.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown ID.
    pub async fn get_chunks_limited(
        &self,
        task_id: &TaskId,
        from_seq: u64,
        limit: usize,
    ) -> Result<ChunkPage> {
        self.chunks.read(task_id, from_seq, Some(limit)).await
    }

    /// Requests cancellation.
    ///
    /// The request is durable before this returns. The returned fence is the
    /// exclusive upper bound on chunk sequences the task will ever hold.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown ID.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: &TaskId) -> Result<CancelAck> {
        let task = self.registry.get(task_id).await?;
        if task.is_terminal() {
            return Ok(CancelAck {
                accepted: false,
                fence: task.cursor,
            });
        }

        self.checkpoints.request_cancel(task_id).await?;
        let intent = self.checkpoints.intent(task_id).await?;
        let task = self.registry.get(task_id).await?;

        let after_intent = intent.map_or(0, |i| i.sequence + 1);
        let fence = task.cursor.max(after_intent);
        let accepted = task.status != TaskStatus::Completed && task.status != TaskStatus::Failed;
        tracing::info!(fence, accepted, "cancellation requested");
        Ok(CancelAck { accepted, fence })
    }

    /// Returns cache statistics.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats().await
    }

    /// Deletes expired cache entries.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheUnavailable` if storage fails.
    pub async fn sweep_cache(&self) -> Result<u64> {
        self.cache.sweep().await
    }

    /// Polls until the task is terminal and returns its outcome.
    ///
    /// Single-flight followers use this to receive the owner's result.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown ID.
    pub async fn wait_for_outcome(&self, task_id: &TaskId, poll: Duration) -> Result<TaskOutcome> {
        loop {
            let task = self.registry.get(task_id).await?;
            match task.status {
                TaskStatus::Completed => {
                    let text = self
                        .chunks
                        .read_all(task_id)
                        .await?
                        .into_iter()
                        .map(|chunk| chunk.payload)
                        .collect();
                    return Ok(TaskOutcome::Completed { text });
                }
                TaskStatus::Failed => return Ok(TaskOutcome::Failed { error: task.error }),
                TaskStatus::Cancelled => {
                    return Ok(TaskOutcome::Cancelled {
                        cursor: task.cursor,
                    });
                }
                _ => tokio::time::sleep(poll).await,
            }
        }
    }
}
