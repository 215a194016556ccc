//! Offline provider that echoes the prompt back.

use async_trait::async_trait;

use super::{Generator, GeneratorError};
use crate::task::GenerationParams;

/// Deterministic generator that returns the prompt unchanged.
///
/// Useful for local runs and demos where no provider credentials exist.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator {
    _private: (),
}

impl EchoGenerator {
    /// Creates an echo generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    fn default_model(&self) -> &str {
        "echo-1"
    }

    async fn generate(&self, params: &GenerationParams) -> Result<String, GeneratorError> {
        Ok(params.prompt.clone())
    }
}
