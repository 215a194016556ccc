//! Worker pool.
//!
//! Each worker loops: scan the active index, try to lease and drive every
//! task it finds, then sleep until the poll interval elapses, a submission
//! wakes it, or shutdown is requested. The first scan after start is the
//! recovery scan: tasks left non-terminal by a crashed process are found
//! through the same active index and resumed once their leases expire.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use spool_core::WorkerId;

use crate::error::Result;
use crate::orchestrator::{DriveOutcome, Orchestrator};
use crate::registry::TaskRegistry;

/// Summary of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Active tasks seen.
    pub seen: usize,
    /// Tasks driven to a terminal status.
    pub settled: usize,
    /// Tasks leased by another worker.
    pub busy: usize,
    /// Drives that ended in an error or a lost lease.
    pub interrupted: usize,
}

/// A pool of workers driving active tasks.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    orchestrator: Orchestrator,
    registry: TaskRegistry,
    worker_count: usize,
    poll_interval: Duration,
    wake: Arc<Notify>,
}

impl WorkerPool {
    /// Creates a pool. `wake` is notified by submitters.
    #[must_use]
    pub fn new(
        orchestrator: Orchestrator,
        registry: TaskRegistry,
        worker_count: usize,
        poll_interval: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            worker_count: worker_count.max(1),
            poll_interval,
            wake,
        }
    }

    /// Scans the active index once and drives every task this worker can
    /// lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the active index cannot be listed. Failures of
    /// individual drives are logged and counted, not returned.
    pub async fn scan(&self, worker: &WorkerId) -> Result<ScanReport> {
        let mut active = self.registry.list_active().await?;
        active.shuffle(&mut rand::thread_rng());

        let mut report = ScanReport {
            seen: active.len(),
            ..ScanReport::default()
        };
        for task in active {
            match self.orchestrator.drive(task.id, worker).await {
                Ok(DriveOutcome::Settled(status)) => {
                    tracing::debug!(task_id = %task.id, %status, "task settled");
                    report.settled += 1;
                }
                Ok(DriveOutcome::Busy { holder_id }) => {
                    tracing::trace!(task_id = %task.id, holder = %holder_id, "task leased elsewhere");
                    report.busy += 1;
                }
                Ok(DriveOutcome::LeaseLost) => report.interrupted += 1,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "drive interrupted");
                    report.interrupted += 1;
                }
            }
        }
        Ok(report)
    }

    /// Scans repeatedly until no active task is left or a scan settles
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the active index cannot be listed.
    pub async fn drain(&self, worker: &WorkerId) -> Result<ScanReport> {
        let mut total = ScanReport::default();
        loop {
            let report = self.scan(worker).await?;
            total.seen += report.seen;
            total.settled += report.settled;
            total.busy += report.busy;
            total.interrupted += report.interrupted;
            if report.seen == 0 || report.settled == 0 {
                return Ok(total);
            }
        }
    }

    /// Spawns the worker loops.
    #[must_use]
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..self.worker_count)
            .map(|index| {
                let pool = self.clone();
                let worker = WorkerId::generate(&format!("worker-{index}"));
                let shutdown = shutdown.subscribe();
                tokio::spawn(async move { pool.run_worker(worker, shutdown).await })
            })
            .collect();
        tracing::info!(workers = self.worker_count, "worker pool started");
        WorkerPoolHandle { shutdown, handles }
    }

    async fn run_worker(&self, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker = %worker, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.scan(&worker).await {
                tracing::warn!(worker = %worker, error = %e, "scan failed");
            }
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = %worker, "worker stopped");
    }
}

/// Handle to running worker loops.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Stops the workers after their current drive and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker task ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }

    /// Aborts the workers immediately, as a crash would.
    pub fn abort(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
