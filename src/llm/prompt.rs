//! Prompt construction for LLM requests.
//!
//! Builds the system prompt with the schema and the reply protocol the flow
//! model parses.

use crate::db::{DatabaseBackend, Schema};
use crate::llm::types::Message;

/// Prefix of messages that carry an execution observation back to the model.
pub const OBSERVATION_PREFIX: &str = "Observation:";

/// Prefix a reply starts with when the model needs more input from the user.
pub const CLARIFY_PREFIX: &str = "CLARIFY:";

const SYSTEM_PROMPT_TEMPLATE: &str = r#"You are a SQL assistant for a {dialect} database. You answer questions by running SQL and reading the results.

DATABASE SCHEMA:
{schema}

INSTRUCTIONS:
- Generate only valid {dialect} SQL, one statement at a time
- Use appropriate JOINs based on foreign keys
- Only read data unless the user explicitly asks for a change
- After each statement you receive a message starting with "Observation:" holding the result or the error
- If a statement failed, correct it and try again

OUTPUT FORMAT:
- To run SQL, reply with the statement wrapped in a ```sql code block. Put any reasoning before the block.
- To ask the user a question, reply with a line starting with "CLARIFY:".
- When you can answer, reply in plain text with no code block."#;

fn dialect_name(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::Postgres => "PostgreSQL",
        DatabaseBackend::Sqlite => "SQLite",
    }
}

/// Builds the system prompt with the database schema injected.
pub fn build_system_prompt(backend: DatabaseBackend, schema: &Schema) -> String {
    let schema_text = if schema.is_empty() {
        "(schema unavailable)".to_string()
    } else {
        schema.format_for_llm()
    };

    SYSTEM_PROMPT_TEMPLATE
        .replace("{dialect}", dialect_name(backend))
        .replace("{schema}", &schema_text)
}

/// Builds the full request: system prompt, history, then the current turn.
pub fn build_messages(
    backend: DatabaseBackend,
    schema: &Schema,
    history: &[Message],
    turn: &[Message],
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + turn.len() + 1);
    messages.push(Message::system(build_system_prompt(backend, schema)));
    messages.extend(history.iter().cloned());
    messages.extend(turn.iter().cloned());
    messages
}
