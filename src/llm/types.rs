//! Message types for LLM communication.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and internal notices.
    System,
    /// Human input.
    User,
    /// Model output.
    Assistant,
}

impl Role {
    /// Returns the role as a string for API requests and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("Unknown message role: {other}")),
        }
    }
}

/// A single message sent to or received from the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Bounded conversation history.
///
/// Keeps the most recent `max_exchanges` exchanges, where an exchange starts
/// at a user message. Leading system messages are always kept.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    max_exchanges: usize,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::with_max_exchanges(10)
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_exchanges(max_exchanges: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_exchanges,
        }
    }

    pub fn add(&mut self, message: Message) {
        self.messages.push(message);
        self.trim_to_limit();
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.add(Message::user(content));
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.add(Message::assistant(content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn trim_to_limit(&mut self) {
        let exchange_starts: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i)
            .collect();

        let excess = exchange_starts.len().saturating_sub(self.max_exchanges);
        if excess == 0 {
            return;
        }

        let cut = exchange_starts
            .get(excess)
            .copied()
            .unwrap_or(self.messages.len());

        self.messages = std::mem::take(&mut self.messages)
            .into_iter()
            .enumerate()
            .filter(|(i, m)| *i >= cut || m.role == Role::System)
            .map(|(_, m)| m)
            .collect();
    }
}
