//! Database abstraction layer.
//!
//! Provides a trait-based interface over the external, user-supplied
//! databases a conversation talks to. Backends are chosen from the scheme of
//! the connection descriptor (DSN).

mod errors;
mod mock;
mod postgres;
mod schema;
mod sqlite;
mod types;

pub use mock::MockDatabaseClient;
pub use postgres::PostgresClient;
pub use schema::{Column, ForeignKey, Schema, Table};
pub use sqlite::SqliteClient;
pub use types::{ColumnInfo, QueryResult, Row, Value};

use crate::config::DatabaseConfig;
use crate::error::ExecutionError;
use async_trait::async_trait;
use url::Url;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Sqlite,
}

impl DatabaseBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Determines the backend from a DSN scheme.
    pub fn from_dsn(dsn: &str) -> Option<Self> {
        let scheme = dsn.split(':').next()?.to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Returns a DSN with any password replaced, for logs and listings.
pub fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => dsn.to_string(),
    }
}

/// Opens a client for the given DSN.
pub async fn connect(dsn: &str, config: &DatabaseConfig) -> Result<Box<dyn DatabaseClient>, ExecutionError> {
    match DatabaseBackend::from_dsn(dsn) {
        Some(DatabaseBackend::Postgres) => {
            Ok(Box::new(PostgresClient::connect(dsn, config).await?))
        }
        Some(DatabaseBackend::Sqlite) => Ok(Box::new(SqliteClient::connect(dsn, config).await?)),
        None => Err(ExecutionError::connection(format!(
            "Unsupported connection string '{}'. Expected postgres:// or sqlite:",
            redact_dsn(dsn)
        ))),
    }
}

/// Interface every external database backend implements.
///
/// Errors are already narrowed to `ExecutionError`; driver types never
/// cross this trait.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Which backend this client talks to.
    fn backend(&self) -> DatabaseBackend;

    /// Introspects tables and relationships for the model prompt.
    async fn introspect_schema(&self) -> Result<Schema, ExecutionError>;

    /// Executes a statement, materializing at most `limit` rows.
    ///
    /// The full column list is returned even when rows are truncated or the
    /// result is empty.
    async fn execute_query(&self, sql: &str, limit: usize) -> Result<QueryResult, ExecutionError>;

    /// Prepares a statement without running it and returns its columns.
    async fn describe(&self, sql: &str) -> Result<Vec<ColumnInfo>, ExecutionError>;

    /// Closes the underlying pool.
    async fn close(&self);
}

/// Opens database clients from connection descriptors.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn open(&self, dsn: &str) -> Result<Box<dyn DatabaseClient>, ExecutionError>;
}

/// Connector that dispatches on the DSN scheme.
#[derive(Debug, Clone, Default)]
pub struct DsnConnector {
    config: DatabaseConfig,
}

impl DsnConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DatabaseConnector for DsnConnector {
    async fn open(&self, dsn: &str) -> Result<Box<dyn DatabaseClient>, ExecutionError> {
        connect(dsn, &self.config).await
    }
}
