//! Per-step retry policies.
//!
//! Each attempt runs under the step's timeout. Failures are classified as
//! [`StepError::Fatal`] (returned immediately) or [`StepError::Transient`]
//! (retried with capped exponential backoff and jitter until the attempt
//! budget is spent). A timeout counts as a transient failure.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::metrics::FlowMetrics;
use crate::task::TaskStep;

/// Retry policy for one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
    /// Per-attempt timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Creates a policy with a multiplier of 2.
    #[must_use]
    pub const fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            multiplier: 2,
            timeout,
        }
    }

    /// Default policy for request validation.
    #[must_use]
    pub const fn validate_default() -> Self {
        Self::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(10),
        )
    }

    /// Default policy for text generation.
    #[must_use]
    pub const fn generate_default() -> Self {
        Self::new(
            3,
            Duration::from_secs(5),
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
    }

    /// Default policy for chunk persistence.
    #[must_use]
    pub const fn persist_default() -> Self {
        Self::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
    }

    /// Returns the un-jittered delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Returns the delay after `attempt`, jittered into `[delay / 2, delay]`.
    #[must_use]
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let half = delay / 2;
        let spread = u64::try_from((delay - half).as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Runs `op` under this policy.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns a [`StepFailure`] carrying the last error and the attempts
    /// made when a fatal error occurs or the budget is exhausted.
    pub async fn run<T, F, Fut>(
        &self,
        step: TaskStep,
        metrics: &FlowMetrics,
        mut op: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, op(attempt))
                .await
                .unwrap_or_else(|_| Err(StepError::Transient(timeout_error(step, self.timeout))));

            match outcome {
                Ok(value) => {
                    metrics.observe_step_duration(step.as_label(), "ok", started.elapsed());
                    return Ok(value);
                }
                Err(StepError::Fatal(error)) => {
                    metrics.observe_step_duration(step.as_label(), "fatal", started.elapsed());
                    return Err(StepFailure {
                        error,
                        attempts: attempt,
                    });
                }
                Err(StepError::Transient(error)) => {
                    metrics.observe_step_duration(step.as_label(), "transient", started.elapsed());
                    if attempt >= self.max_attempts {
                        return Err(StepFailure {
                            error,
                            attempts: attempt,
                        });
                    }
                    let delay = self.jittered_backoff(attempt);
                    tracing::warn!(
                        step = %step,
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        error = %error,
                        "step failed transiently, retrying"
                    );
                    metrics.record_retry(step.as_label());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::persist_default()
    }
}

/// Retry policies for every pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicies {
    /// Validation policy.
    pub validate: RetryPolicy,
    /// Generation policy.
    pub generate: RetryPolicy,
    /// Persistence policy.
    pub persist: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            validate: RetryPolicy::validate_default(),
            generate: RetryPolicy::generate_default(),
            persist: RetryPolicy::persist_default(),
        }
    }
}

impl RetryPolicies {
    /// Returns the policy for a step.
    #[must_use]
    pub const fn for_step(&self, step: TaskStep) -> &RetryPolicy {
        match step {
            TaskStep::Validate => &self.validate,
            TaskStep::Generate => &self.generate,
            TaskStep::Persist => &self.persist,
        }
    }

    /// Returns the policy for a step, mutably.
    pub fn for_step_mut(&mut self, step: TaskStep) -> &mut RetryPolicy {
        match step {
            TaskStep::Validate => &mut self.validate,
            TaskStep::Generate => &mut self.generate,
            TaskStep::Persist => &mut self.persist,
        }
    }
}

/// A classified step failure.
#[derive(Debug)]
pub enum StepError {
    /// Not retryable.
    Fatal(Error),
    /// Retryable.
    Transient(Error),
}

impl StepError {
    /// Classifies an engine error by [`Error::is_transient`].
    #[must_use]
    pub fn classify(error: Error) -> Self {
        if error.is_transient() {
            Self::Transient(error)
        } else {
            Self::Fatal(error)
        }
    }
}

impl From<Error> for StepError {
    fn from(error: Error) -> Self {
        Self::classify(error)
    }
}

/// A step that gave up.
#[derive(Debug)]
pub struct StepFailure {
    /// The last error.
    pub error: Error,
    /// Attempts made.
    pub attempts: u32,
}

fn timeout_error(step: TaskStep, timeout: Duration) -> Error {
    let message = format!("{step} step timed out after {timeout:?}");
    match step {
        TaskStep::Persist => Error::persistence(message),
        TaskStep::Validate | TaskStep::Generate => Error::TransientProvider { message },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(4),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::generate_default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        assert_eq!(policy.backoff(4), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::persist_default();
        for attempt in 1..6 {
            let delay = policy.jittered_backoff(attempt);
            assert!(delay <= policy.backoff(attempt));
            assert!(delay >= policy.backoff(attempt) / 2);
        }
    }

    #[test]
    fn defaults_per_step() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.for_step(TaskStep::Validate).timeout, Duration::from_secs(10));
        assert_eq!(policies.for_step(TaskStep::Generate).timeout, Duration::from_secs(300));
        assert_eq!(
            policies.for_step(TaskStep::Persist).initial_backoff,
            Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run(TaskStep::Generate, &FlowMetrics::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(StepError::Transient(Error::TransientProvider {
                            message: "overloaded".into(),
                        }))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.ok(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let failure = fast(3)
            .run(TaskStep::Validate, &FlowMetrics::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StepError::Fatal(Error::validation("empty prompt"))) }
            })
            .await
            .expect_err("fatal");
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.error, Error::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let failure = fast(2)
            .run(TaskStep::Persist, &FlowMetrics::new(), |attempt| async move {
                Err::<(), _>(StepError::Transient(Error::persistence(format!("disk full #{attempt}"))))
            })
            .await
            .expect_err("exhausted");
        assert_eq!(failure.attempts, 2);
        assert!(failure.error.to_string().contains("#2"));
    }

    #[tokio::test]
    async fn timeouts_count_as_transient() {
        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        let failure = policy
            .run(TaskStep::Generate, &FlowMetrics::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StepError>(())
            })
            .await
            .expect_err("timeout");
        assert_eq!(failure.attempts, 2);
        assert!(matches!(failure.error, Error::TransientProvider { .. }));
    }

    #[test]
    fn policy_serializes_humantime() {
        let json = serde_json::to_value(RetryPolicy::persist_default()).expect("serialize");
        assert_eq!(json["initialBackoff"], "100ms");
        assert_eq!(json["timeout"], "5s");
    }
}
