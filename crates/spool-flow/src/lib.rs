//! # spool-flow
//!
//! Durable, resumable text generation engine.
//!
//! A submission becomes a task record in storage. Workers lease tasks and
//! drive them through validation, generation and chunk persistence. Every
//! step leaves durable evidence, so a task interrupted by a crash resumes
//! where it stopped instead of starting over.
//!
//! ## Components
//!
//! - **Registry**: Authoritative task records with compare-and-swap status
//!   transitions and an index of non-terminal tasks
//! - **Chunk Log**: Append-only, gap-free, idempotent per-task chunk storage
//! - **Cache Index**: Fingerprint-keyed result cache with single-flight
//!   claims so identical concurrent requests share one generation
//! - **Orchestrator**: The state machine driver, with per-step retry
//!   policies, recovery from checkpoints and fenced cancellation
//! - **Generators**: Provider adapters behind one async trait
//! - **Workers**: A leased worker pool that doubles as the recovery scanner
//!
//! ## Guarantees
//!
//! - **Exactly-once chunks**: Sequence `n` is written at most once and only
//!   after `0..n` exist
//! - **No repeated provider calls**: Generated text is checkpointed before
//!   any chunk is written
//! - **Monotonic status**: A terminal task never changes again
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use spool_core::{MemoryBackend, WorkerId};
//! use spool_flow::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let engine = Engine::new(Arc::new(MemoryBackend::new()), EngineConfig::default())?;
//! let receipt = engine
//!     .submit(GenerationRequest::new("Say hello to the world", "echo"))
//!     .await?;
//!
//! engine.worker_pool().drain(&WorkerId::new("local")).await?;
//!
//! let outcome = engine
//!     .wait_for_outcome(&receipt.task_id, Duration::from_millis(50))
//!     .await?;
//! assert!(matches!(outcome, TaskOutcome::Completed { .. }));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod checkpoint;
pub mod chunk_log;
pub mod chunking;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod generator;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod retry;
pub mod task;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{CacheEntry, CacheIndex, CacheStats, ClaimOutcome};
    pub use crate::checkpoint::{CheckpointStore, GenerationCheckpoint};
    pub use crate::chunk_log::{AppendOutcome, Chunk, ChunkLog, ChunkPage};
    pub use crate::chunking::{BoundaryMode, Chunker};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{CancelAck, Engine, SubmitReceipt, TaskOutcome, TaskStatusReport};
    pub use crate::error::{Error, Result};
    pub use crate::generator::{Generator, GeneratorError, GeneratorRegistry};
    pub use crate::metrics::FlowMetrics;
    pub use crate::orchestrator::{DriveOutcome, Orchestrator};
    pub use crate::registry::TaskRegistry;
    pub use crate::request::GenerationRequest;
    pub use crate::retry::{RetryPolicies, RetryPolicy};
    pub use crate::task::{GenerationParams, Task, TaskError, TaskStatus, TaskStep};
    pub use crate::worker::{ScanReport, WorkerPool, WorkerPoolHandle};
}
