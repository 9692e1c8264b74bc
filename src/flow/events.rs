//! Events streamed to the caller while a query runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, ExecutionErrorKind, ParleyError, Result};
use crate::query::TransportResult;

/// One step of a query invocation, in production order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Free-text reasoning the model gave before a statement.
    ReasoningStep { step: usize, text: String },

    /// The model proposed a statement; `step_id` links it to its result.
    SqlProposed { step_id: Uuid, step: usize, sql: String },

    /// A statement ran. `result.linked_id` equals the proposing `step_id`.
    SqlResult { result: TransportResult },

    /// A statement failed; the failure was handed back to the model.
    SqlFailed {
        step_id: Uuid,
        kind: ExecutionErrorKind,
        message: String,
    },

    /// The invocation produced its answer.
    FinalAnswer {
        message_id: Uuid,
        text: String,
        needs_clarification: bool,
    },

    /// The invocation failed; nothing was persisted.
    Error { kind: ErrorKind, message: String },
}

impl StreamEvent {
    pub fn error(err: &ParleyError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// True for events after which nothing else is sent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalAnswer { .. } | Self::Error { .. })
    }
}

/// Destination of stream events.
///
/// `emit` waits until the event is accepted and fails with
/// `ParleyError::ConsumerDisconnected` once nobody is listening.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, event: StreamEvent) -> Result<()>;
}

#[async_trait]
impl EventSink for Vec<StreamEvent> {
    async fn emit(&mut self, event: StreamEvent) -> Result<()> {
        self.push(event);
        Ok(())
    }
}
