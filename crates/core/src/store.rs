//! Conversation store — append-only persistence for thread messages.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::Message;

/// Append-only message persistence, scoped by organization and thread.
///
/// Implementations: in-memory, SQLite, and the client's HTTP store.
/// No implementation may update or delete a stored message.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "memory", "http").
    fn name(&self) -> &str;

    /// Append a message to a thread, returning its id.
    ///
    /// Messages with a non-persistable role are rejected.
    async fn append(&self, thread_id: &str, org_id: &str, message: &Message) -> Result<String, StoreError>;

    /// The most recently appended message of a thread, if any.
    async fn last_message(&self, thread_id: &str, org_id: &str) -> Result<Option<Message>, StoreError>;

    /// All messages of a thread in append order.
    async fn history(&self, thread_id: &str, org_id: &str) -> Result<Vec<Message>, StoreError>;
}

/// Shared guard for implementations: refuse messages that only live inside a turn.
pub fn ensure_persistable(message: &Message) -> Result<(), StoreError> {
    if message.role.is_persistable() && message.tool_calls.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!(
            "{} message {} carries in-turn tool traffic",
            message.role.as_str(),
            message.id
        )))
    }
}
