//! Conversation persistence.
//!
//! Conversations are soft-deleted: `deleted_at` hides the record and its
//! messages from every read in this module.

use crate::error::{ParleyError, Result};
use crate::persistence::{get_connection, parse_id, parse_timestamp, timestamp};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
struct ConversationRow {
    id: String,
    connection_id: String,
    name: String,
    created_at: String,
}

/// A conversation bound to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = ParleyError;

    fn try_from(row: ConversationRow) -> Result<Self> {
        Ok(Self {
            id: parse_id(&row.id)?,
            connection_id: parse_id(&row.connection_id)?,
            name: row.name,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

/// Creates a conversation on a live connection.
pub async fn create_conversation(
    pool: &SqlitePool,
    connection_id: Uuid,
    name: &str,
) -> Result<Conversation> {
    if get_connection(pool, connection_id).await?.is_none() {
        return Err(ParleyError::not_found(format!("connection {connection_id}")));
    }

    let conversation = Conversation {
        id: Uuid::new_v4(),
        connection_id,
        name: name.to_string(),
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO conversations (id, connection_id, name, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(conversation.id.to_string())
    .bind(connection_id.to_string())
    .bind(&conversation.name)
    .bind(timestamp(conversation.created_at))
    .execute(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to create conversation: {e}")))?;

    Ok(conversation)
}

/// Gets a conversation unless it was deleted.
pub async fn get_conversation(pool: &SqlitePool, id: Uuid) -> Result<Option<Conversation>> {
    let row: Option<ConversationRow> = sqlx::query_as(
        r#"
        SELECT id, connection_id, name, created_at
        FROM conversations
        WHERE id = ? AND deleted_at IS NULL
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to get conversation: {e}")))?;

    row.map(Conversation::try_from).transpose()
}

/// Lists live conversations, newest first, optionally for one connection.
pub async fn list_conversations(
    pool: &SqlitePool,
    connection_id: Option<Uuid>,
) -> Result<Vec<Conversation>> {
    let rows: Vec<ConversationRow> = sqlx::query_as(
        r#"
        SELECT id, connection_id, name, created_at
        FROM conversations
        WHERE deleted_at IS NULL AND (?1 IS NULL OR connection_id = ?1)
        ORDER BY created_at DESC, rowid DESC
        "#,
    )
    .bind(connection_id.map(|id| id.to_string()))
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to list conversations: {e}")))?;

    rows.into_iter().map(Conversation::try_from).collect()
}

/// Renames a live conversation.
pub async fn rename_conversation(pool: &SqlitePool, id: Uuid, name: &str) -> Result<()> {
    let result =
        sqlx::query("UPDATE conversations SET name = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(name)
            .bind(id.to_string())
            .execute(pool)
            .await
            .map_err(|e| ParleyError::persistence(format!("Failed to rename conversation: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(ParleyError::not_found(format!("conversation {id}")));
    }
    Ok(())
}

/// Soft-deletes a conversation. Returns false when it did not exist.
pub async fn delete_conversation(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result =
        sqlx::query("UPDATE conversations SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(timestamp(Utc::now()))
            .bind(id.to_string())
            .execute(pool)
            .await
            .map_err(|e| ParleyError::persistence(format!("Failed to delete conversation: {e}")))?;

    Ok(result.rows_affected() > 0)
}
