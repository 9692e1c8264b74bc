//! Connection persistence.
//!
//! A connection names an external database by DSN. The query pipeline only
//! reads connections; deletion hides the record instead of removing it so
//! conversations that point at it keep their history.

use crate::db::{redact_dsn, DatabaseBackend};
use crate::error::{ParleyError, Result};
use crate::persistence::{parse_id, parse_timestamp, timestamp};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
struct ConnectionRow {
    id: String,
    name: String,
    dsn: String,
    created_at: String,
}

/// A saved external database connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub dsn: String,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    /// Returns the backend selected by the DSN scheme.
    pub fn backend(&self) -> Option<DatabaseBackend> {
        DatabaseBackend::from_dsn(&self.dsn)
    }

    /// Returns the DSN with any password hidden.
    pub fn display_dsn(&self) -> String {
        redact_dsn(&self.dsn)
    }
}

impl TryFrom<ConnectionRow> for Connection {
    type Error = ParleyError;

    fn try_from(row: ConnectionRow) -> Result<Self> {
        Ok(Self {
            id: parse_id(&row.id)?,
            name: row.name,
            dsn: row.dsn,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

/// Lists all live connections ordered by name.
pub async fn list_connections(pool: &SqlitePool) -> Result<Vec<Connection>> {
    let rows: Vec<ConnectionRow> = sqlx::query_as(
        r#"
        SELECT id, name, dsn, created_at
        FROM connections
        WHERE deleted_at IS NULL
        ORDER BY name, created_at
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to list connections: {e}")))?;

    rows.into_iter().map(Connection::try_from).collect()
}

/// Gets a live connection by id.
pub async fn get_connection(pool: &SqlitePool, id: Uuid) -> Result<Option<Connection>> {
    let row: Option<ConnectionRow> = sqlx::query_as(
        r#"
        SELECT id, name, dsn, created_at
        FROM connections
        WHERE id = ? AND deleted_at IS NULL
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to get connection: {e}")))?;

    row.map(Connection::try_from).transpose()
}

/// Creates a connection. The DSN scheme must name a supported backend.
pub async fn create_connection(pool: &SqlitePool, name: &str, dsn: &str) -> Result<Connection> {
    if name.trim().is_empty() {
        return Err(ParleyError::config("Connection name must not be empty"));
    }
    if DatabaseBackend::from_dsn(dsn).is_none() {
        return Err(ParleyError::config(format!(
            "Unsupported connection string: {}",
            redact_dsn(dsn)
        )));
    }

    let connection = Connection {
        id: Uuid::new_v4(),
        name: name.trim().to_string(),
        dsn: dsn.to_string(),
        created_at: Utc::now(),
    };

    sqlx::query("INSERT INTO connections (id, name, dsn, created_at) VALUES (?, ?, ?, ?)")
        .bind(connection.id.to_string())
        .bind(&connection.name)
        .bind(&connection.dsn)
        .bind(timestamp(connection.created_at))
        .execute(pool)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to create connection: {e}")))?;

    Ok(connection)
}

/// Hides a connection. Returns false when it did not exist.
pub async fn delete_connection(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result =
        sqlx::query("UPDATE connections SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(timestamp(Utc::now()))
            .bind(id.to_string())
            .execute(pool)
            .await
            .map_err(|e| ParleyError::persistence(format!("Failed to delete connection: {e}")))?;

    Ok(result.rows_affected() > 0)
}
