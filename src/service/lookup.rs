//! Conversation and connection lookup for the coordinator.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{ParleyError, Result};
use crate::llm::Message;
use crate::persistence::{self, Connection, Conversation, StateDb};

/// Read-only access to the records a query invocation needs.
#[async_trait]
pub trait ConversationLookup: Send + Sync {
    /// Returns the conversation and its connection.
    ///
    /// A missing or deleted record on either side is `NotFound`.
    async fn resolve(&self, conversation_id: Uuid) -> Result<(Conversation, Connection)>;

    /// Returns the stored messages of the conversation, oldest first.
    async fn history(&self, conversation_id: Uuid) -> Result<Vec<Message>>;
}

/// Lookup backed by the application state database.
#[derive(Debug, Clone)]
pub struct StateLookup {
    state: StateDb,
}

impl StateLookup {
    pub fn new(state: StateDb) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ConversationLookup for StateLookup {
    async fn resolve(&self, conversation_id: Uuid) -> Result<(Conversation, Connection)> {
        let pool = self.state.pool();

        let conversation = persistence::get_conversation(pool, conversation_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(format!("conversation {conversation_id}")))?;

        let connection = persistence::get_connection(pool, conversation.connection_id)
            .await?
            .ok_or_else(|| {
                ParleyError::not_found(format!("connection {}", conversation.connection_id))
            })?;

        Ok((conversation, connection))
    }

    async fn history(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let stored = persistence::list_messages(self.state.pool(), conversation_id).await?;
        Ok(stored
            .into_iter()
            .map(|m| Message::new(m.role, m.content))
            .collect())
    }
}
