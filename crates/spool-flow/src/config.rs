//! Engine configuration.
//!
//! Every knob has a default and may be overridden from `SPOOL_*`
//! environment variables. Provider credentials come from the conventional
//! `OPENAI_API_KEY` and `ANTHROPIC_API_KEY` variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use spool_core::lease::DEFAULT_LEASE_TTL;

use crate::cache::{DEFAULT_CACHE_TTL, DEFAULT_CLAIM_GRACE};
use crate::chunking::{BoundaryMode, Chunker, DEFAULT_CHUNK_WINDOW};
use crate::error::{Error, Result};
use crate::generator::{
    AnthropicGenerator, DEFAULT_ANTHROPIC_MODEL, DEFAULT_OPENAI_MODEL, EchoGenerator,
    GeneratorRegistry, OpenAiGenerator,
};
use crate::retry::RetryPolicies;
use crate::task::TaskStep;

const ENV_DATA_DIR: &str = "SPOOL_DATA_DIR";
const ENV_CHUNK_WINDOW: &str = "SPOOL_CHUNK_WINDOW";
const ENV_CHUNK_BOUNDARY: &str = "SPOOL_CHUNK_BOUNDARY";
const ENV_CACHE_TTL_SECS: &str = "SPOOL_CACHE_TTL_SECS";
const ENV_LEASE_TTL_SECS: &str = "SPOOL_LEASE_TTL_SECS";
const ENV_WORKER_COUNT: &str = "SPOOL_WORKER_COUNT";
const ENV_POLL_INTERVAL_MS: &str = "SPOOL_POLL_INTERVAL_MS";
const ENV_CLAIM_GRACE_SECS: &str = "SPOOL_CLAIM_GRACE_SECS";
const ENV_DEFAULT_OPENAI_MODEL: &str = "SPOOL_DEFAULT_OPENAI_MODEL";
const ENV_DEFAULT_ANTHROPIC_MODEL: &str = "SPOOL_DEFAULT_ANTHROPIC_MODEL";
const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const ENV_ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";

const DEFAULT_DATA_DIR: &str = ".spool";
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Engine configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Root directory of the local filesystem backend.
    pub data_dir: PathBuf,
    /// Chunk window in graphemes.
    pub chunk_window: usize,
    /// Chunk boundary mode.
    pub chunk_boundary: BoundaryMode,
    /// Cache entry time-to-live.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Task lease time-to-live.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Number of worker loops.
    pub worker_count: usize,
    /// Delay between scans for ready tasks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Time a single-flight claim may exist without its owner's record.
    #[serde(with = "humantime_serde")]
    pub claim_grace: Duration,
    /// Per-step retry policies.
    pub retry: RetryPolicies,
    /// Model used for `openai` requests that name none.
    pub default_openai_model: String,
    /// Model used for `anthropic` requests that name none.
    pub default_anthropic_model: String,
    /// `OpenAI` API key.
    #[serde(skip)]
    pub openai_api_key: Option<String>,
    /// Anthropic API key.
    #[serde(skip)]
    pub anthropic_api_key: Option<String>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("data_dir", &self.data_dir)
            .field("chunk_window", &self.chunk_window)
            .field("chunk_boundary", &self.chunk_boundary)
            .field("cache_ttl", &self.cache_ttl)
            .field("lease_ttl", &self.lease_ttl)
            .field("worker_count", &self.worker_count)
            .field("poll_interval", &self.poll_interval)
            .field("claim_grace", &self.claim_grace)
            .field("retry", &self.retry)
            .field("default_openai_model", &self.default_openai_model)
            .field("default_anthropic_model", &self.default_anthropic_model)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .field(
                "anthropic_api_key",
                &self.anthropic_api_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            chunk_window: DEFAULT_CHUNK_WINDOW,
            chunk_boundary: BoundaryMode::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
            lease_ttl: DEFAULT_LEASE_TTL,
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            claim_grace: DEFAULT_CLAIM_GRACE,
            retry: RetryPolicies::default(),
            default_openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            default_anthropic_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for malformed values.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for malformed values.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = non_empty(&get_env, ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(window) = parse_positive(&get_env, ENV_CHUNK_WINDOW)? {
            config.chunk_window = usize::try_from(window).map_err(|_| {
                Error::configuration(format!("{ENV_CHUNK_WINDOW} value {window} is too large"))
            })?;
        }
        if let Some(mode) = non_empty(&get_env, ENV_CHUNK_BOUNDARY) {
            config.chunk_boundary = mode.parse()?;
        }
        if let Some(secs) = parse_positive(&get_env, ENV_CACHE_TTL_SECS)? {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&get_env, ENV_LEASE_TTL_SECS)? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(count) = parse_positive(&get_env, ENV_WORKER_COUNT)? {
            config.worker_count = usize::try_from(count).map_err(|_| {
                Error::configuration(format!("{ENV_WORKER_COUNT} value {count} is too large"))
            })?;
        }
        if let Some(ms) = parse_positive(&get_env, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&get_env, ENV_CLAIM_GRACE_SECS)? {
            config.claim_grace = Duration::from_secs(secs);
        }

        for step in [TaskStep::Validate, TaskStep::Generate, TaskStep::Persist] {
            let prefix = format!("SPOOL_{}", step.as_label().to_ascii_uppercase());
            let policy = config.retry.for_step_mut(step);
            if let Some(attempts) = parse_positive(&get_env, &format!("{prefix}_MAX_ATTEMPTS"))? {
                policy.max_attempts = u32::try_from(attempts).map_err(|_| {
                    Error::configuration(format!("{prefix}_MAX_ATTEMPTS value {attempts} is too large"))
                })?;
            }
            if let Some(secs) = parse_positive(&get_env, &format!("{prefix}_TIMEOUT_SECS"))? {
                policy.timeout = Duration::from_secs(secs);
            }
        }

        if let Some(model) = non_empty(&get_env, ENV_DEFAULT_OPENAI_MODEL) {
            config.default_openai_model = model;
        }
        if let Some(model) = non_empty(&get_env, ENV_DEFAULT_ANTHROPIC_MODEL) {
            config.default_anthropic_model = model;
        }
        config.openai_api_key = non_empty(&get_env, ENV_OPENAI_API_KEY);
        config.anthropic_api_key = non_empty(&get_env, ENV_ANTHROPIC_API_KEY);

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_window == 0 {
            return Err(Error::configuration("chunk_window must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(Error::configuration("worker_count must be at least 1"));
        }
        if self.lease_ttl < Duration::from_secs(1) {
            return Err(Error::configuration("lease_ttl must be at least 1s"));
        }
        for step in [TaskStep::Validate, TaskStep::Generate, TaskStep::Persist] {
            if self.retry.for_step(step).max_attempts == 0 {
                return Err(Error::configuration(format!(
                    "{step} retry policy needs at least one attempt"
                )));
            }
        }
        Ok(())
    }

    /// Builds the chunker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the window is zero.
    pub fn chunker(&self) -> Result<Chunker> {
        Chunker::new(self.chunk_window, self.chunk_boundary)
    }

    /// Builds the registry of built-in providers: `openai`, `anthropic` and
    /// `echo`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if an HTTP client cannot be built.
    pub fn generators(&self) -> Result<GeneratorRegistry> {
        let openai = OpenAiGenerator::new(self.openai_api_key.clone())?
            .with_default_model(self.default_openai_model.clone());
        let anthropic = AnthropicGenerator::new(self.anthropic_api_key.clone())?
            .with_default_model(self.default_anthropic_model.clone());
        Ok(GeneratorRegistry::new()
            .with("openai", Arc::new(openai))
            .with("anthropic", Arc::new(anthropic))
            .with("echo", Arc::new(EchoGenerator::new())))
    }
}

fn non_empty<F>(get_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    get_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64<F>(get_env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(get_env, key)
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| {
                Error::configuration(format!("{key} must be a non-negative integer, got '{raw}'"))
            })
        })
        .transpose()
}

fn parse_positive<F>(get_env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_u64(get_env, key)? {
        Some(0) => Err(Error::configuration(format!(
            "{key} must be greater than zero"
        ))),
        other => Ok(other),
    }
}
