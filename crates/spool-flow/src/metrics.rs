//! Observability metrics for the generation engine.
//!
//! Metrics are recorded through the `metrics` crate facade; installing an
//! exporter (Prometheus or otherwise) is left to the embedding binary.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `spool_tasks_total` | Counter | `from_state`, `to_state` | Task status transitions |
//! | `spool_step_duration_seconds` | Histogram | `step`, `result` | Pipeline step latency |
//! | `spool_step_retries_total` | Counter | `step` | Step retries after transient failures |
//! | `spool_chunks_appended_total` | Counter | `result` | Chunk appends (written, duplicate) |
//! | `spool_cache_lookups_total` | Counter | `result` | Cache lookups (hit, miss, error) |
//! | `spool_cache_evictions_total` | Counter | - | Expired cache entries removed |
//! | `spool_singleflight_total` | Counter | `result` | Single-flight claims (leader, joined, takeover) |
//! | `spool_leases_total` | Counter | `result` | Lease acquisitions (acquired, held, lost) |
//! | `spool_active_tasks` | Gauge | - | Non-terminal tasks seen by the last scan |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use spool_flow::metrics::FlowMetrics;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_task_transition("generating", "persisting");
//! metrics.record_cache_lookup("hit");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Total task status transitions.
    pub const TASKS_TOTAL: &str = "spool_tasks_total";
    /// Histogram: Pipeline step duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "spool_step_duration_seconds";
    /// Counter: Step retries.
    pub const STEP_RETRIES_TOTAL: &str = "spool_step_retries_total";
    /// Counter: Chunk appends.
    pub const CHUNKS_APPENDED_TOTAL: &str = "spool_chunks_appended_total";
    /// Counter: Cache lookups.
    pub const CACHE_LOOKUPS_TOTAL: &str = "spool_cache_lookups_total";
    /// Counter: Cache evictions.
    pub const CACHE_EVICTIONS_TOTAL: &str = "spool_cache_evictions_total";
    /// Counter: Single-flight claim outcomes.
    pub const SINGLEFLIGHT_TOTAL: &str = "spool_singleflight_total";
    /// Counter: Lease acquisition outcomes.
    pub const LEASES_TOTAL: &str = "spool_leases_total";
    /// Gauge: Active tasks.
    pub const ACTIVE_TASKS: &str = "spool_active_tasks";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous task state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target task state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Pipeline step (validate, generate, persist).
    pub const STEP: &str = "step";
    /// Result status.
    pub const RESULT: &str = "result";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a task status transition.
    pub fn record_task_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::TASKS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records a pipeline step duration.
    pub fn observe_step_duration(&self, step: &str, result: &str, duration: Duration) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            labels::STEP => step.to_string(),
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a step retry.
    pub fn record_retry(&self, step: &str) {
        counter!(names::STEP_RETRIES_TOTAL, labels::STEP => step.to_string()).increment(1);
    }

    /// Records a chunk append.
    pub fn record_chunk_append(&self, result: &str) {
        counter!(names::CHUNKS_APPENDED_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records a cache lookup.
    pub fn record_cache_lookup(&self, result: &str) {
        counter!(names::CACHE_LOOKUPS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records cache evictions.
    pub fn record_cache_evictions(&self, count: u64) {
        counter!(names::CACHE_EVICTIONS_TOTAL).increment(count);
    }

    /// Records a single-flight outcome.
    pub fn record_singleflight(&self, result: &str) {
        counter!(names::SINGLEFLIGHT_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records a lease acquisition outcome.
    pub fn record_lease(&self, result: &str) {
        counter!(names::LEASES_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Sets the number of active tasks.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_active_tasks(&self, count: usize) {
        gauge!(names::ACTIVE_TASKS).set(count as f64);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use spool_flow::metrics::{FlowMetrics, TimingGuard};
///
/// let metrics = FlowMetrics::new();
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_step_duration("generate", "ok", duration);
///     });
///     // Do work...
/// }
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_metrics_record_without_recorder() {
        let metrics = FlowMetrics::new();
        metrics.record_task_transition("created", "validating");
        metrics.observe_step_duration("generate", "ok", Duration::from_millis(5));
        metrics.record_retry("persist");
        metrics.record_chunk_append("written");
        metrics.record_cache_lookup("miss");
        metrics.record_cache_evictions(2);
        metrics.record_singleflight("leader");
        metrics.record_lease("acquired");
        metrics.set_active_tasks(3);
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(10)));
    }
}
