//! Working context the model sees during one invocation.
//!
//! Past exchanges are kept apart from the messages of the current turn so
//! the history bound never trims the question being answered.

use crate::db::{DatabaseBackend, Schema};
use crate::error::ExecutionError;
use crate::llm::{build_messages, Conversation, Message, OBSERVATION_PREFIX};
use crate::query::QueryRunResult;

#[derive(Debug, Clone)]
pub struct FlowContext {
    backend: DatabaseBackend,
    schema: Schema,
    history: Vec<Message>,
    turn: Vec<Message>,
    secure: bool,
}

impl FlowContext {
    /// Starts a turn. `history` is cut to the last `max_exchanges` exchanges.
    pub fn new(
        backend: DatabaseBackend,
        schema: Schema,
        history: Vec<Message>,
        max_exchanges: usize,
        question: &str,
        secure: bool,
    ) -> Self {
        let mut bounded = Conversation::with_max_exchanges(max_exchanges);
        for message in history {
            bounded.add(message);
        }

        Self {
            backend,
            schema,
            history: bounded.into_messages(),
            turn: vec![Message::user(question)],
            secure,
        }
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn turn(&self) -> &[Message] {
        &self.turn
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Full request for the model: system prompt, history, current turn.
    pub fn messages(&self) -> Vec<Message> {
        build_messages(self.backend, &self.schema, &self.history, &self.turn)
    }

    /// Records the statement the model proposed as its own reply.
    pub fn record_proposal(&mut self, reasoning: Option<&str>, sql: &str) {
        let content = match reasoning {
            Some(text) if !text.trim().is_empty() => format!("{text}\n```sql\n{sql}\n```"),
            _ => format!("```sql\n{sql}\n```"),
        };
        self.turn.push(Message::assistant(content));
    }

    /// Feeds a successful result back. With `secure` only the shape is shown.
    pub fn observe_result(&mut self, result: &QueryRunResult) {
        let mut text = format!(
            "{OBSERVATION_PREFIX} the statement returned {} row(s){}.\nColumns: {}",
            result.row_count(),
            if result.truncated() { " (truncated)" } else { "" },
            result.columns().join(", ")
        );

        if self.secure {
            text.push_str("\nRow values are hidden.");
        } else {
            for row in result.rows() {
                let cells: Vec<String> = row.iter().map(|v| v.to_display_string()).collect();
                text.push('\n');
                text.push_str(&cells.join(" | "));
            }
        }

        self.turn.push(Message::user(text));
    }

    /// Feeds an execution failure back so the model can correct itself.
    pub fn observe_failure(&mut self, error: &ExecutionError) {
        self.turn.push(Message::user(format!(
            "{OBSERVATION_PREFIX} the statement failed ({}): {}",
            error.kind, error.message
        )));
    }
}
