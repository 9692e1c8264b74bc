//! The model's side of the flow.
//!
//! The engine only needs the next action. `LlmFlowModel` gets it from any
//! `LlmClient` by sending the context and parsing the reply.

use async_trait::async_trait;
use std::time::Instant;

use super::context::FlowContext;
use crate::error::{FlowError, Result};
use crate::llm::{parse_llm_response, LlmClient, CLARIFY_PREFIX};

/// What the model wants to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    ProposeSql {
        sql: String,
        reasoning: Option<String>,
    },
    AskClarification(String),
    FinalAnswer(String),
}

#[async_trait]
pub trait FlowModel: Send + Sync {
    async fn next_action(&self, context: &FlowContext) -> Result<FlowAction>;
}

/// Adapts an `LlmClient` to the flow.
pub struct LlmFlowModel {
    client: Box<dyn LlmClient>,
}

impl LlmFlowModel {
    pub fn new(client: Box<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Maps a raw reply onto an action.
    pub fn interpret(reply: &str) -> FlowAction {
        let trimmed = reply.trim();
        if let Some(question) = trimmed.strip_prefix(CLARIFY_PREFIX) {
            return FlowAction::AskClarification(question.trim().to_string());
        }

        let parsed = parse_llm_response(trimmed);
        match parsed.sql {
            Some(sql) => FlowAction::ProposeSql {
                sql,
                reasoning: (!parsed.text.is_empty()).then_some(parsed.text),
            },
            None => FlowAction::FinalAnswer(parsed.text),
        }
    }
}

#[async_trait]
impl FlowModel for LlmFlowModel {
    async fn next_action(&self, context: &FlowContext) -> Result<FlowAction> {
        let messages = context.messages();
        let start = Instant::now();
        tracing::debug!(message_count = messages.len(), "Asking model for next action");

        let reply = self
            .client
            .complete(&messages)
            .await
            .map_err(|e| FlowError::ModelUnavailable(e.to_string()))?;

        if reply.trim().is_empty() {
            return Err(FlowError::ModelUnavailable("model returned an empty reply".into()).into());
        }

        tracing::debug!(
            llm_duration_ms = start.elapsed().as_millis(),
            response_len = reply.len(),
            "Received model reply"
        );
        Ok(Self::interpret(&reply))
    }
}
