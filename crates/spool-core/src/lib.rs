//! # spool-core
//!
//! Durable primitives for the spool generation engine.
//!
//! This crate provides the foundational types used by the engine:
//!
//! - **Identifiers**: ULID-backed task IDs and worker IDs
//! - **Storage**: An object-storage contract with conditional writes, an
//!   in-memory backend for tests and a crash-safe local filesystem backend
//! - **Leases**: Time-bounded, fenced exclusive claims stored as objects
//! - **Canonical JSON**: Deterministic encoding for request fingerprints
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use spool_core::prelude::*;
//!
//! let task_id = TaskId::generate();
//! let record_key = SpoolPaths::task_record(&task_id);
//! assert!(record_key.starts_with("tasks/"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod error;
pub mod fs_storage;
pub mod id;
pub mod lease;
pub mod observability;
pub mod paths;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fs_storage::LocalFsBackend;
    pub use crate::id::{TaskId, WorkerId};
    pub use crate::lease::{AcquireOutcome, FencingToken, Lease, LeaseInfo, LeaseManager};
    pub use crate::paths::SpoolPaths;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use fs_storage::LocalFsBackend;
pub use id::{TaskId, WorkerId};
pub use lease::{AcquireOutcome, FencingToken, Lease, LeaseInfo, LeaseManager};
pub use observability::{LogFormat, init_logging};
pub use paths::SpoolPaths;
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
