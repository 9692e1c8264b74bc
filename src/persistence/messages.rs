//! Message and result persistence.
//!
//! Messages are append-only. Writes only happen through `UnitOfWork`, which
//! calls the insert functions inside its flush transaction.

use std::collections::HashMap;

use crate::error::{ParleyError, Result};
use crate::llm::Role;
use crate::persistence::{parse_id, parse_timestamp, timestamp};
use crate::query::TransportResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    created_at: String,
}

#[derive(Debug, Clone, FromRow)]
struct ResultRow {
    id: String,
    message_id: String,
    linked_id: String,
    sql: String,
    content: String,
    for_chart: bool,
    secure: bool,
    created_at: String,
}

/// A persisted message with the results attached to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub results: Vec<StoredResult>,
}

/// A persisted statement result. `result` is already masked when `secure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResult {
    pub id: Uuid,
    pub message_id: Uuid,
    pub linked_id: Uuid,
    pub sql: String,
    pub result: TransportResult,
    pub for_chart: bool,
    pub secure: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for StoredResult {
    type Error = ParleyError;

    fn try_from(row: ResultRow) -> Result<Self> {
        let result: TransportResult = serde_json::from_str(&row.content)
            .map_err(|e| ParleyError::persistence(format!("Corrupt result {}: {e}", row.id)))?;
        Ok(Self {
            id: parse_id(&row.id)?,
            message_id: parse_id(&row.message_id)?,
            linked_id: parse_id(&row.linked_id)?,
            sql: row.sql,
            result,
            for_chart: row.for_chart,
            secure: row.secure,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

/// A message waiting in a unit-of-work.
#[derive(Debug, Clone)]
pub(crate) struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A result waiting in a unit-of-work.
#[derive(Debug, Clone)]
pub(crate) struct NewResult {
    pub id: Uuid,
    pub message_id: Uuid,
    pub sql: String,
    pub result: TransportResult,
    pub created_at: DateTime<Utc>,
}

/// Lists the messages of a live conversation in insertion order.
pub async fn list_messages(pool: &SqlitePool, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
    let rows: Vec<MessageRow> = sqlx::query_as(
        r#"
        SELECT m.id, m.conversation_id, m.role, m.content, m.created_at
        FROM messages m
        JOIN conversations c ON c.id = m.conversation_id
        WHERE m.conversation_id = ? AND c.deleted_at IS NULL
        ORDER BY m.rowid
        "#,
    )
    .bind(conversation_id.to_string())
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to list messages: {e}")))?;

    let result_rows: Vec<ResultRow> = sqlx::query_as(
        r#"
        SELECT r.id, r.message_id, r.linked_id, r.sql, r.content, r.for_chart, r.secure, r.created_at
        FROM results r
        JOIN messages m ON m.id = r.message_id
        WHERE m.conversation_id = ?
        ORDER BY r.rowid
        "#,
    )
    .bind(conversation_id.to_string())
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to list results: {e}")))?;

    let mut results: HashMap<Uuid, Vec<StoredResult>> = HashMap::new();
    for row in result_rows {
        let result = StoredResult::try_from(row)?;
        results.entry(result.message_id).or_default().push(result);
    }

    rows.into_iter()
        .map(|row| {
            let id = parse_id(&row.id)?;
            Ok(StoredMessage {
                id,
                conversation_id: parse_id(&row.conversation_id)?,
                role: row.role.parse().map_err(ParleyError::persistence)?,
                content: row.content,
                created_at: parse_timestamp(&row.created_at)?,
                results: results.remove(&id).unwrap_or_default(),
            })
        })
        .collect()
}

pub(crate) async fn insert_message(conn: &mut SqliteConnection, message: &NewMessage) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(message.id.to_string())
    .bind(message.conversation_id.to_string())
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(timestamp(message.created_at))
    .execute(conn)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to insert message: {e}")))?;

    Ok(())
}

pub(crate) async fn insert_result(conn: &mut SqliteConnection, result: &NewResult) -> Result<()> {
    let content = serde_json::to_string(&result.result)
        .map_err(|e| ParleyError::persistence(format!("Failed to encode result: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO results (id, message_id, linked_id, sql, content, for_chart, secure, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(result.id.to_string())
    .bind(result.message_id.to_string())
    .bind(result.result.linked_id.to_string())
    .bind(&result.sql)
    .bind(content)
    .bind(result.result.for_chart)
    .bind(result.result.secure)
    .bind(timestamp(result.created_at))
    .execute(conn)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to insert result: {e}")))?;

    Ok(())
}
