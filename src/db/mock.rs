//! Mock database client for testing.
//!
//! Returns canned results keyed on SQL fragments and records every
//! statement it receives.

use super::{ColumnInfo, DatabaseBackend, DatabaseClient, QueryResult, Schema};
use crate::error::ExecutionError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Canned {
    Result(QueryResult),
    Error(ExecutionError),
}

/// A mock database client that returns predefined results.
///
/// Clones share the statement log, so a test can keep one handle while the
/// code under test owns another.
#[derive(Debug, Clone, Default)]
pub struct MockDatabaseClient {
    schema: Schema,
    responses: Vec<(String, Canned)>,
    executed: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl MockDatabaseClient {
    /// Creates a new mock database client with an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Returns `result` for any statement containing `pattern` (case-insensitive).
    pub fn with_result(mut self, pattern: impl Into<String>, result: QueryResult) -> Self {
        self.responses.push((pattern.into(), Canned::Result(result)));
        self
    }

    /// Fails any statement containing `pattern` with `error`.
    pub fn with_error(mut self, pattern: impl Into<String>, error: ExecutionError) -> Self {
        self.responses.push((pattern.into(), Canned::Error(error)));
        self
    }

    /// Statements passed to `execute_query`, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or(false)
    }

    fn lookup(&self, sql: &str) -> Option<&Canned> {
        let sql_lower = sql.to_lowercase();
        self.responses
            .iter()
            .find(|(pattern, _)| sql_lower.contains(&pattern.to_lowercase()))
            .map(|(_, canned)| canned)
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Sqlite
    }

    async fn introspect_schema(&self) -> Result<Schema, ExecutionError> {
        Ok(self.schema.clone())
    }

    async fn execute_query(&self, sql: &str, limit: usize) -> Result<QueryResult, ExecutionError> {
        if let Ok(mut log) = self.executed.lock() {
            log.push(sql.to_string());
        }

        match self.lookup(sql) {
            Some(Canned::Error(e)) => Err(e.clone()),
            Some(Canned::Result(result)) => {
                let mut result = result.clone();
                if result.rows.len() > limit {
                    result.rows.truncate(limit);
                    result.was_truncated = true;
                }
                Ok(result.with_execution_time(Duration::from_millis(1)))
            }
            None => Err(ExecutionError::syntax(format!("no canned result for: {sql}"))),
        }
    }

    async fn describe(&self, sql: &str) -> Result<Vec<ColumnInfo>, ExecutionError> {
        match self.lookup(sql) {
            Some(Canned::Error(e)) => Err(e.clone()),
            Some(Canned::Result(result)) => Ok(result.columns.clone()),
            None => Err(ExecutionError::syntax(format!("no canned result for: {sql}"))),
        }
    }

    async fn close(&self) {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
    }
}
