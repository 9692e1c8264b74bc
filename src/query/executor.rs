//! Single-statement execution against an external database.

use tracing::debug;
use uuid::Uuid;

use super::result::QueryRunResult;
use crate::db::{DatabaseClient, QueryResult};
use crate::error::ExecutionError;
use crate::safety::SqlClassifier;

/// Default maximum number of rows materialized per statement.
pub const DEFAULT_ROW_LIMIT: usize = 10;

/// Per-call execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Maximum rows to materialize.
    pub limit: usize,
    /// When false the statement is only prepared, never run.
    pub execute: bool,
    /// Marks the result as carrying masked-on-transport values.
    pub secure: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_ROW_LIMIT,
            execute: true,
            secure: false,
        }
    }
}

/// Runs one statement with the write gate applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExecutor {
    allow_writes: bool,
}

impl QueryExecutor {
    pub fn new(allow_writes: bool) -> Self {
        Self { allow_writes }
    }

    /// Executes `sql` and links the result to `linked_id`.
    ///
    /// On the dry path (`execute = false`) the backend only prepares the
    /// statement; the result has the prepared columns and no rows.
    pub async fn execute(
        &self,
        client: &dyn DatabaseClient,
        sql: &str,
        linked_id: Uuid,
        options: ExecuteOptions,
    ) -> Result<QueryRunResult, ExecutionError> {
        let raw = if options.execute {
            self.check_writes(client, sql)?;
            debug!(limit = options.limit, "Executing statement");
            client.execute_query(sql, options.limit).await?
        } else {
            debug!("Preparing statement without execution");
            QueryResult::columns_only(client.describe(sql).await?)
        };

        let run = QueryRunResult::from_query(raw, linked_id)?.with_secure(options.secure);
        debug!(
            rows = run.row_count(),
            truncated = run.truncated(),
            execution_time_ms = run.execution_time().as_millis() as u64,
            "Statement finished"
        );
        Ok(run)
    }

    fn check_writes(&self, client: &dyn DatabaseClient, sql: &str) -> Result<(), ExecutionError> {
        if self.allow_writes {
            return Ok(());
        }

        let classification = SqlClassifier::for_backend(client.backend()).classify(sql);
        if classification.is_read_only() {
            return Ok(());
        }

        let reason = classification
            .parse_error
            .unwrap_or_else(|| format!("{} statements are not allowed", classification.kind));
        Err(ExecutionError::permission_denied(format!(
            "Refused {} statement: {reason}",
            classification.level
        )))
    }
}
