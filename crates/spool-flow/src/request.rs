//! Submitted generation requests: normalization and validation rules.
//!
//! Normalization runs at submission and produces the [`GenerationParams`]
//! that are fingerprinted. The range rules run later, in the Validate step,
//! so a malformed request becomes a `Failed` task with a recorded reason.

use serde::{Deserialize, Serialize};

use spool_core::TaskId;

use crate::error::{Error, Result};
use crate::generator::GeneratorRegistry;
use crate::task::GenerationParams;

/// Shortest accepted prompt, in characters, after trimming.
pub const MIN_PROMPT_CHARS: usize = 3;
/// Longest accepted prompt, in characters, after trimming.
pub const MAX_PROMPT_CHARS: usize = 10_000;
/// Largest accepted `max_tokens`.
pub const MAX_TOKENS_LIMIT: u32 = 100_000;
/// `max_tokens` when the request omits it.
pub const DEFAULT_MAX_TOKENS: u32 = 4_000;
/// Largest accepted temperature, in milli-units.
pub const MAX_TEMPERATURE_MILLI: u32 = 2_000;
/// Temperature when the request omits it, in milli-units.
pub const DEFAULT_TEMPERATURE_MILLI: u32 = 700;

/// A generation request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Caller-chosen task ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Prompt text.
    pub prompt: String,
    /// Provider selector (`openai`, `anthropic`, `echo`, ...).
    pub provider: String,
    /// Model; the provider default when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    /// Creates a request with provider defaults for everything else.
    #[must_use]
    pub fn new(prompt: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            task_id: None,
            prompt: prompt.into(),
            provider: provider.into(),
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Sets the caller-chosen task ID.
    #[must_use]
    pub const fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets `max_tokens`.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Normalizes the request: trims the prompt, lowercases the provider,
    /// resolves the default model and scales the temperature to milli-units.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the temperature is not a finite,
    /// non-negative number.
    pub fn normalize(&self, generators: &GeneratorRegistry) -> Result<GenerationParams> {
        let provider = self.provider.trim().to_ascii_lowercase();
        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(ToString::to_string)
            .or_else(|| generators.default_model(&provider))
            .unwrap_or_default();

        let temperature_milli = match self.temperature {
            None => DEFAULT_TEMPERATURE_MILLI,
            Some(t) if t.is_finite() && t >= 0.0 && t <= f64::from(u32::MAX) / 1000.0 => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let milli = (t * 1000.0).round() as u32;
                milli
            }
            Some(t) => {
                return Err(Error::validation(format!(
                    "temperature must be a non-negative number, got {t}"
                )));
            }
        };

        Ok(GenerationParams {
            prompt: self.prompt.trim().to_string(),
            provider,
            model,
            temperature_milli,
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        })
    }
}

/// Checks normalized parameters against the request rules.
///
/// # Errors
///
/// Returns `Error::Validation` naming the first violated rule.
pub fn validate_params(params: &GenerationParams, generators: &GeneratorRegistry) -> Result<()> {
    let prompt_chars = params.prompt.chars().count();
    if prompt_chars < MIN_PROMPT_CHARS {
        return Err(Error::validation(format!(
            "prompt must be at least {MIN_PROMPT_CHARS} characters, got {prompt_chars}"
        )));
    }
    if prompt_chars > MAX_PROMPT_CHARS {
        return Err(Error::validation(format!(
            "prompt must be at most {MAX_PROMPT_CHARS} characters, got {prompt_chars}"
        )));
    }
    if generators.get(&params.provider).is_none() {
        return Err(Error::validation(format!(
            "unknown provider '{}' (registered: {})",
            params.provider,
            generators.providers().join(", ")
        )));
    }
    if params.model.is_empty() {
        return Err(Error::validation("model must not be empty"));
    }
    if params.max_tokens == 0 || params.max_tokens > MAX_TOKENS_LIMIT {
        return Err(Error::validation(format!(
            "max_tokens must be between 1 and {MAX_TOKENS_LIMIT}, got {}",
            params.max_tokens
        )));
    }
    if params.temperature_milli > MAX_TEMPERATURE_MILLI {
        return Err(Error::validation(format!(
            "temperature must be between 0 and 2.0, got {}",
            params.temperature()
        )));
    }
    Ok(())
}
