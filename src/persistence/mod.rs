//! Persistence layer for db-parley.
//!
//! Manages the local SQLite application state: connections, conversations,
//! messages and their results. Query invocations write through a
//! `UnitOfWork` so that a turn is stored all at once or not at all.

mod connections;
mod conversations;
mod messages;
mod migrations;
mod unit_of_work;

pub use connections::{
    create_connection, delete_connection, get_connection, list_connections, Connection,
};
pub use conversations::{
    create_conversation, delete_conversation, get_conversation, list_conversations,
    rename_conversation, Conversation,
};
pub use messages::{list_messages, StoredMessage, StoredResult};
pub use unit_of_work::UnitOfWork;

use crate::error::{ParleyError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 100;

/// Process-wide handle to the application state database.
///
/// Opened once at startup and shared by every concurrent invocation.
#[derive(Debug, Clone)]
pub struct StateDb {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl StateDb {
    /// Opens or creates the state database at the specified path.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        Self::ensure_parent_dirs(path)?;

        let mut last_error = None;
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * 2u64.pow(attempt)))
                    .await;
            }

            match Self::connect(path, max_connections).await {
                Ok(pool) => {
                    migrations::run_migrations(&pool).await?;
                    info!(path = %path.display(), max_connections, "State database opened");
                    return Ok(Self {
                        pool,
                        db_path: path.to_path_buf(),
                    });
                }
                Err(e) => {
                    warn!(attempt, "Failed to open state database: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ParleyError::persistence("Failed to open state database after retries")
        }))
    }

    /// Returns the default state database path for the current platform.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ParleyError::persistence("Could not determine config directory"))?;
        Ok(config_dir.join("db-parley").join("state.db"))
    }

    async fn connect(path: &Path, max_connections: u32) -> Result<SqlitePool> {
        let conn_str = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| ParleyError::persistence(format!("Invalid database path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                ParleyError::persistence(format!("Failed to connect to state database: {e}"))
            })
    }

    fn ensure_parent_dirs(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ParleyError::persistence(format!(
                    "Failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Starts a unit-of-work for one query invocation.
    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork::new(self.pool.clone())
    }

    /// Closes the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.db_path.display(), "State database closed");
    }
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ParleyError::persistence(format!("Invalid timestamp '{value}': {e}")))
}

pub(crate) fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| ParleyError::persistence(format!("Invalid id '{value}': {e}")))
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    migrations::run_migrations(&pool).await.unwrap();
    pool
}
