//! Generation provider abstraction.
//!
//! The orchestrator depends only on the [`Generator`] trait. Providers
//! classify their own failures as [`GeneratorError::Transient`] (network
//! trouble, overload, rate limits) or [`GeneratorError::Fatal`] (the request
//! itself is unacceptable), and the orchestrator applies the retry policy.
//!
//! ## Implementations
//!
//! - [`EchoGenerator`]: Deterministic offline provider for local runs
//! - [`OpenAiGenerator`]: Chat completions API
//! - [`AnthropicGenerator`]: Messages API

mod anthropic;
mod echo;
mod openai;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::task::GenerationParams;

pub use anthropic::{AnthropicGenerator, DEFAULT_ANTHROPIC_BASE_URL, DEFAULT_ANTHROPIC_MODEL};
pub use echo::EchoGenerator;
pub use openai::{DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL, OpenAiGenerator};

/// Timeout applied by the HTTP clients of the remote providers.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Classified generation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorError {
    /// Retryable failure.
    #[error("transient: {0}")]
    Transient(String),
    /// Non-retryable failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GeneratorError {
    /// Returns true for retryable failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classifies an HTTP status code returned by a provider.
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("provider returned {status}: {body}");
        if status.is_server_error()
            || matches!(
                status,
                reqwest::StatusCode::REQUEST_TIMEOUT
                    | reqwest::StatusCode::CONFLICT
                    | reqwest::StatusCode::TOO_MANY_REQUESTS
            )
        {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }

    /// Classifies a transport-level failure.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            Self::Transient(format!("provider request failed: {err}"))
        } else {
            Self::Fatal(format!("provider request failed: {err}"))
        }
    }
}

/// A text generation provider.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;

    /// Generates the complete text for a request.
    ///
    /// # Errors
    ///
    /// Returns a classified [`GeneratorError`].
    async fn generate(&self, params: &GenerationParams) -> Result<String, GeneratorError>;

    /// Checks that the provider can serve the request, before generation.
    ///
    /// # Errors
    ///
    /// Returns a classified [`GeneratorError`].
    async fn preflight(&self, _params: &GenerationParams) -> Result<(), GeneratorError> {
        Ok(())
    }
}

/// Maps provider selectors to generators.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Arc<dyn Generator>>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("providers", &self.generators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GeneratorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a generator under a provider selector (case-insensitive).
    #[must_use]
    pub fn with(mut self, provider: &str, generator: Arc<dyn Generator>) -> Self {
        self.register(provider, generator);
        self
    }

    /// Registers a generator under a provider selector (case-insensitive).
    pub fn register(&mut self, provider: &str, generator: Arc<dyn Generator>) {
        self.generators
            .insert(provider.trim().to_ascii_lowercase(), generator);
    }

    /// Looks up a generator.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<dyn Generator>> {
        self.generators.get(provider).cloned()
    }

    /// Returns the default model of a provider.
    #[must_use]
    pub fn default_model(&self, provider: &str) -> Option<String> {
        self.generators
            .get(provider)
            .map(|g| g.default_model().to_string())
    }

    /// Returns the registered provider selectors.
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        self.generators.keys().map(String::as_str).collect()
    }
}
