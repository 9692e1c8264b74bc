//! Schema versioning and migrations for the state database.
//!
//! Forward-only. Each migration runs in its own transaction together with
//! the row that records it.

use crate::error::{ParleyError, Result};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::info;

const CURRENT_VERSION: i32 = 1;

/// Runs all pending migrations on the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    ensure_schema_versions_table(pool).await?;

    let current = get_current_version(pool).await?;

    if current > CURRENT_VERSION {
        return Err(ParleyError::persistence(format!(
            "Database schema version ({current}) is newer than supported version \
             ({CURRENT_VERSION}). Please upgrade db-parley."
        )));
    }

    if current < CURRENT_VERSION {
        info!(from = current, to = CURRENT_VERSION, "Migrating state database");
        for version in (current + 1)..=CURRENT_VERSION {
            apply(pool, version).await?;
            info!("Applied migration v{version}");
        }
    }

    Ok(())
}

async fn ensure_schema_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        ParleyError::persistence(format!("Failed to create schema_versions table: {e}"))
    })?;

    Ok(())
}

async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM schema_versions")
        .fetch_optional(pool)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to get schema version: {e}")))?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

async fn apply(pool: &SqlitePool, version: i32) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to start migration: {e}")))?;

    match version {
        1 => migration_v1(&mut *tx).await?,
        _ => {
            return Err(ParleyError::persistence(format!(
                "Unknown migration version: {version}"
            )))
        }
    }

    sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to record migration: {e}")))?;

    tx.commit()
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to commit migration: {e}")))
}

/// Migration v1: connections, conversations, messages and results.
async fn migration_v1(conn: &mut SqliteConnection) -> Result<()> {
    let statements = [
        (
            "connections table",
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                dsn TEXT NOT NULL,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            )
            "#,
        ),
        (
            "conversations table",
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                connection_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                deleted_at TEXT,
                FOREIGN KEY (connection_id) REFERENCES connections(id)
            )
            "#,
        ),
        (
            "conversations index",
            "CREATE INDEX IF NOT EXISTS idx_conversations_connection ON conversations(connection_id)",
        ),
        (
            "messages table",
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('system', 'user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )
            "#,
        ),
        (
            "messages index",
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
        ),
        (
            "results table",
            r#"
            CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                linked_id TEXT NOT NULL,
                sql TEXT NOT NULL,
                content TEXT NOT NULL,
                for_chart INTEGER NOT NULL DEFAULT 0,
                secure INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (message_id) REFERENCES messages(id)
            )
            "#,
        ),
        (
            "results index",
            "CREATE INDEX IF NOT EXISTS idx_results_message ON results(message_id)",
        ),
    ];

    for (what, sql) in statements {
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| ParleyError::persistence(format!("Failed to create {what}: {e}")))?;
    }

    Ok(())
}
