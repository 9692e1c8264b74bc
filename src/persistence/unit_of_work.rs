//! Deferred writes for one query invocation.
//!
//! A `UnitOfWork` collects messages and results in memory while the flow
//! runs. `commit` flushes them in a single SQLite transaction; `rollback`
//! (or dropping the unit without a decision) discards them. Both consume
//! the unit, so the decision is made exactly once.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{insert_message, insert_result, NewMessage, NewResult};
use crate::error::{ParleyError, Result};
use crate::llm::Role;
use crate::query::TransportResult;

#[derive(Debug)]
enum PendingWrite {
    Message(NewMessage),
    Result(NewResult),
}

/// Buffered side effects of one invocation.
#[derive(Debug)]
pub struct UnitOfWork {
    id: Uuid,
    pool: SqlitePool,
    pending: Vec<PendingWrite>,
    decided: bool,
}

impl UnitOfWork {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        let id = Uuid::new_v4();
        debug!(unit = %id, "Unit of work opened");
        Self {
            id,
            pool,
            pending: Vec::new(),
            decided: false,
        }
    }

    /// Buffers a message and returns its id.
    pub fn add_message(
        &mut self,
        conversation_id: Uuid,
        role: Role,
        content: impl Into<String>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.pending.push(PendingWrite::Message(NewMessage {
            id,
            conversation_id,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }));
        id
    }

    /// Buffers a result attached to a message buffered earlier.
    pub fn add_result(
        &mut self,
        message_id: Uuid,
        sql: impl Into<String>,
        result: TransportResult,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.pending.push(PendingWrite::Result(NewResult {
            id,
            message_id,
            sql: sql.into(),
            result,
            created_at: Utc::now(),
        }));
        id
    }

    /// Number of buffered writes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flushes every buffered write in one transaction.
    ///
    /// On failure the transaction is rolled back and nothing is stored.
    pub async fn commit(mut self) -> Result<usize> {
        self.decided = true;
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ParleyError::persistence(format!("Failed to begin commit: {e}")))?;

        for write in &pending {
            let written = match write {
                PendingWrite::Message(message) => insert_message(&mut tx, message).await,
                PendingWrite::Result(result) => insert_result(&mut tx, result).await,
            };
            if let Err(e) = written {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(unit = %self.id, "Rollback after failed flush also failed: {rollback_err}");
                }
                return Err(e);
            }
        }

        tx.commit()
            .await
            .map_err(|e| ParleyError::persistence(format!("Failed to commit: {e}")))?;

        info!(unit = %self.id, writes = count, "Unit of work committed");
        Ok(count)
    }

    /// Discards every buffered write. Returns how many were dropped.
    pub fn rollback(mut self) -> usize {
        self.decided = true;
        let discarded = std::mem::take(&mut self.pending).len();
        warn!(unit = %self.id, discarded, "Unit of work rolled back");
        discarded
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.decided && !self.pending.is_empty() {
            warn!(
                unit = %self.id,
                discarded = self.pending.len(),
                "Unit of work dropped without a decision; discarding writes"
            );
        }
    }
}
