//! Test storage with operation recording and failure injection.
//!
//! [`TracingMemoryBackend`] delegates to [`MemoryBackend`] and records every
//! call so tests can assert on the exact storage traffic a component causes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use spool_core::error::{Error, Result};
use spool_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation.
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

impl StorageOp {
    /// Returns the path or prefix the operation touched.
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path } => path,
            Self::List { prefix } => prefix,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Read,
    Write,
    Delete,
}

#[derive(Debug, Clone, Copy)]
enum FailureScope {
    All,
    Writes,
    Deletes,
}

impl FailureScope {
    fn covers(self, kind: OpKind) -> bool {
        match self {
            Self::All => true,
            Self::Writes => kind != OpKind::Read,
            Self::Deletes => kind == OpKind::Delete,
        }
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    prefix: String,
    /// `None` fails forever.
    remaining: Option<u32>,
    scope: FailureScope,
}

/// In-memory storage backend with operation tracing.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    written: Arc<Mutex<Vec<(String, Bytes)>>>,
    failures: Arc<Mutex<Vec<InjectedFailure>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage that sleeps before every operation.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns recorded operations whose path starts with `prefix`.
    pub fn operations_under(&self, prefix: &str) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(|op| op.path().starts_with(prefix))
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Returns every payload successfully written to `path`, oldest first.
    pub fn write_history(&self, path: &str) -> Vec<Bytes> {
        self.written
            .lock()
            .expect("lock")
            .iter()
            .filter(|(written, _)| written == path)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Fails every operation under `prefix` until cleared.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.push_failure(prefix.into(), None, FailureScope::All);
    }

    /// Fails the next `count` writes (puts and deletes) under `prefix`.
    pub fn fail_next_writes(&self, prefix: impl Into<String>, count: u32) {
        self.push_failure(prefix.into(), Some(count), FailureScope::Writes);
    }

    /// Fails the next `count` deletes under `prefix`.
    pub fn fail_next_deletes(&self, prefix: impl Into<String>, count: u32) {
        self.push_failure(prefix.into(), Some(count), FailureScope::Deletes);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.failures.lock().expect("lock").clear();
    }

    /// Returns all stored paths under `prefix`, sorted.
    pub async fn paths(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list(prefix)
            .await
            .expect("list")
            .into_iter()
            .map(|meta| meta.path)
            .collect();
        paths.sort();
        paths
    }

    fn push_failure(&self, prefix: String, remaining: Option<u32>, scope: FailureScope) {
        self.failures.lock().expect("lock").push(InjectedFailure {
            prefix,
            remaining,
            scope,
        });
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str, kind: OpKind) -> Result<()> {
        let mut failures = self.failures.lock().expect("lock");
        let hit = failures.iter_mut().find(|f| {
            path.starts_with(&f.prefix)
                && f.scope.covers(kind)
                && f.remaining.is_none_or(|n| n > 0)
        });
        match hit {
            Some(failure) => {
                if let Some(n) = failure.remaining.as_mut() {
                    *n -= 1;
                }
                Err(Error::Internal {
                    message: format!("injected failure for path: {path}"),
                })
            }
            None => Ok(()),
        }
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.check_failure(path, OpKind::Read)?;
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.record(StorageOp::Put {
            path: path.to_string(),
            precondition: precondition.clone(),
        });
        self.check_failure(path, OpKind::Write)?;
        let result = self.inner.put(path, data.clone(), precondition).await?;
        if result.is_success() {
            self.written
                .lock()
                .expect("lock")
                .push((path.to_string(), data));
        }
        Ok(result)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.maybe_delay().await;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.check_failure(path, OpKind::Delete)?;
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.maybe_delay().await;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.check_failure(prefix, OpKind::Read)?;
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.check_failure(path, OpKind::Read)?;
        self.inner.head(path).await
    }
}
