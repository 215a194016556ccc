//! `OpenAI` chat completions provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DEFAULT_HTTP_TIMEOUT, Generator, GeneratorError};
use crate::error::{Error, Result};
use crate::task::GenerationParams;

/// Default API endpoint.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Default model.
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// Generator backed by the `OpenAI` chat completions API.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for OpenAiGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGenerator")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl OpenAiGenerator {
    /// Creates a generator. Without an API key every call fails fatally.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the HTTP client cannot be built.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            default_model: DEFAULT_OPENAI_MODEL.to_string(),
        })
    }

    /// Overrides the API endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Overrides the default model.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn api_key(&self) -> std::result::Result<&str, GeneratorError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GeneratorError::Fatal("OpenAI API key is not configured".into()))
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn preflight(&self, _params: &GenerationParams) -> std::result::Result<(), GeneratorError> {
        self.api_key().map(|_| ())
    }

    async fn generate(
        &self,
        params: &GenerationParams,
    ) -> std::result::Result<String, GeneratorError> {
        let api_key = self.api_key()?;
        let request = ChatRequest {
            model: &params.model,
            messages: [ChatMessage {
                role: "user",
                content: &params.prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature(),
            stream: false,
        };

        tracing::debug!(model = %params.model, "calling OpenAI chat completions");
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GeneratorError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(GeneratorError::from_status(status, &body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::from_transport(&e))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GeneratorError::Transient("OpenAI response had no content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_fatal() -> Result<()> {
        let generator = OpenAiGenerator::new(None)?;
        let params = GenerationParams {
            prompt: "Hello".into(),
            provider: "openai".into(),
            model: DEFAULT_OPENAI_MODEL.into(),
            temperature_milli: 700,
            max_tokens: 4000,
        };
        assert!(matches!(
            generator.preflight(&params).await,
            Err(GeneratorError::Fatal(_))
        ));
        assert!(matches!(
            generator.generate(&params).await,
            Err(GeneratorError::Fatal(_))
        ));
        Ok(())
    }

    #[test]
    fn debug_redacts_key() -> Result<()> {
        let generator = OpenAiGenerator::new(Some("sk-secret".into()))?;
        assert!(!format!("{generator:?}").contains("sk-secret"));
        Ok(())
    }
}
