//! Mock LLM client for testing.
//!
//! Replies from a script first, then from pattern rules, and records every
//! request it receives.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{ParleyError, Result};
use crate::llm::prompt::OBSERVATION_PREFIX;
use crate::llm::types::{Message, Role};
use crate::llm::LlmClient;

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

/// Mock LLM client with deterministic replies.
///
/// Clones share the script and the request log.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    script: Arc<Mutex<VecDeque<Reply>>>,
    patterns: Vec<(String, String)>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues replies returned in order before any pattern rule applies.
    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        if let Ok(mut script) = client.script.lock() {
            script.extend(replies.into_iter().map(|r| Reply::Text(r.into())));
        }
        client
    }

    /// Queues a failure as the next scripted reply.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Reply::Fail(message.into()));
        }
        self
    }

    /// When the latest user input contains `pattern`, reply with `response`.
    pub fn with_response(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.patterns.push((pattern.into(), response.into()));
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn pattern_reply(&self, input: &str) -> String {
        let input_lower = input.to_lowercase();

        for (pattern, response) in &self.patterns {
            if input_lower.contains(&pattern.to_lowercase()) {
                return response.clone();
            }
        }

        if input.starts_with(OBSERVATION_PREFIX) {
            return "Here is what I found.".to_string();
        }
        if input_lower.contains("how many users") || input_lower.contains("count users") {
            return "```sql\nSELECT COUNT(*) AS count FROM users\n```".to_string();
        }
        if input_lower.contains("all users") || input_lower.contains("show users") {
            return "```sql\nSELECT * FROM users\n```".to_string();
        }

        "CLARIFY: I don't understand that question. Could you please rephrase it?".to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(ParleyError::llm(message)),
            None => {
                let input = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                Ok(self.pattern_reply(input))
            }
        }
    }
}
