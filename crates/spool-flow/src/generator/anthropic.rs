//! Anthropic messages provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DEFAULT_HTTP_TIMEOUT, Generator, GeneratorError};
use crate::error::{Error, Result};
use crate::task::GenerationParams;

/// Default API endpoint.
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Default model.
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";

const API_VERSION: &str = "2023-06-01";

/// Generator backed by the Anthropic messages API.
#[derive(Clone)]
pub struct AnthropicGenerator {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for AnthropicGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicGenerator")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicGenerator {
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
            base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            default_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
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
            .ok_or_else(|| GeneratorError::Fatal("Anthropic API key is not configured".into()))
    }
}

#[async_trait]
impl Generator for AnthropicGenerator {
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
        let request = MessagesRequest {
            model: &params.model,
            max_tokens: params.max_tokens,
            temperature: params.temperature(),
            messages: [Message {
                role: "user",
                content: &params.prompt,
            }],
        };

        tracing::debug!(model = %params.model, "calling Anthropic messages");
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
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

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::from_transport(&e))?;
        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(GeneratorError::Transient(
                "Anthropic response had no text content".into(),
            ));
        }
        Ok(text)
    }
}
