//! OpenAI-compatible LLM client.
//!
//! Talks to the chat completions endpoint of OpenAI or any compatible
//! server (e.g. a local Ollama instance) selected by `base_url`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ParleyError, Result};
use crate::llm::types::Message;
use crate::llm::LlmClient;

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Maximum number of retry attempts for transient errors.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// OpenAI client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key; may be empty for local servers that need none.
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// OpenAI LLM client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ParleyError::llm(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn convert_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    /// Parses an API error response and returns (error, is_retryable).
    fn parse_error(status: reqwest::StatusCode, body: &str) -> (ParleyError, bool) {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return (
                ParleyError::llm("Authentication failed. Check your OPENAI_API_KEY."),
                false,
            );
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return (ParleyError::llm("Rate limited. Please wait and try again."), true);
        }

        let is_retryable = status.is_server_error();

        match serde_json::from_str::<OpenAiErrorResponse>(body) {
            Ok(error_response) => (
                ParleyError::llm(format!("API error: {}", error_response.error.message)),
                is_retryable,
            ),
            Err(_) => (
                ParleyError::llm(format!("API error ({status}): {body}")),
                is_retryable,
            ),
        }
    }

    async fn send_once(&self, request: &OpenAiRequest) -> std::result::Result<String, (ParleyError, bool)> {
        let mut builder = self.client.post(self.config.endpoint()).json(request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder.send().await.map_err(|e| {
            let retryable = e.is_timeout() || e.is_connect();
            let error = if e.is_timeout() {
                ParleyError::llm("Request timed out. Try again.")
            } else if e.is_connect() {
                ParleyError::llm(format!(
                    "Failed to connect to {}. Check your network.",
                    self.config.base_url
                ))
            } else {
                ParleyError::llm(format!("Request failed: {e}"))
            };
            (error, retryable)
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| (ParleyError::llm(format!("Failed to read response: {e}")), false))?;

        if !status.is_success() {
            return Err(Self::parse_error(status, &body));
        }

        let parsed: OpenAiResponse = serde_json::from_str(&body)
            .map_err(|e| (ParleyError::llm(format!("Failed to parse response: {e}")), false))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| (ParleyError::llm("Empty response from model"), false))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let request = OpenAiRequest {
            model: self.config.model.clone(),
            messages: Self::convert_messages(messages),
            stream: false,
        };

        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 1;

        loop {
            debug!(attempt, model = %self.config.model, "Chat completion request");

            match self.send_once(&request).await {
                Ok(content) => return Ok(content),
                Err((error, retryable)) => {
                    if !retryable || attempt >= MAX_RETRY_ATTEMPTS {
                        return Err(error);
                    }
                    warn!(
                        "Chat completion failed (attempt {}), retrying in {:?}: {}",
                        attempt, delay, error
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}
