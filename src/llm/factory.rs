//! LLM client factory.
//!
//! Centralizes provider-specific logic for creating LLM clients.

use crate::config::LlmConfig;
use crate::error::{ParleyError, Result};
use crate::llm::{LlmClient, LlmProvider, MockLlmClient, OpenAiClient, OpenAiConfig};

/// Creates an LLM client from configuration.
///
/// The OpenAI key is read from `OPENAI_API_KEY`. It is optional when a
/// custom `base_url` points at a server that needs none.
pub fn create_client(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    let provider: LlmProvider = config.provider.parse().map_err(ParleyError::config)?;

    match provider {
        LlmProvider::OpenAi => {
            let key = std::env::var("OPENAI_API_KEY").ok();
            let key = match (key, &config.base_url) {
                (Some(key), _) => key,
                (None, Some(_)) => String::new(),
                (None, None) => {
                    return Err(ParleyError::llm(
                        "No API key configured. Set OPENAI_API_KEY or llm.base_url.",
                    ))
                }
            };

            let mut openai = OpenAiConfig::new(key, &config.model).with_timeout(config.timeout_secs);
            if let Some(base_url) = &config.base_url {
                openai = openai.with_base_url(base_url);
            }
            Ok(Box::new(OpenAiClient::new(openai)?))
        }
        LlmProvider::Mock => Ok(Box::new(MockLlmClient::new())),
    }
}
