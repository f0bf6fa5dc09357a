//! In-memory store — useful for testing and ephemeral gateways.

use async_trait::async_trait;
use parley_core::error::StoreError;
use parley_core::message::Message;
use parley_core::store::{ConversationStore, ensure_persistable};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

type ThreadKey = (String, String);

/// Messages kept per `(org_id, thread_id)` in append order.
pub struct InMemoryStore {
    threads: RwLock<HashMap<ThreadKey, Vec<Message>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
        }
    }

    fn key(thread_id: &str, org_id: &str) -> ThreadKey {
        (org_id.to_string(), thread_id.to_string())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, thread_id: &str, org_id: &str, message: &Message) -> Result<String, StoreError> {
        ensure_persistable(message)?;
        let mut message = message.clone();
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        let id = message.id.clone();

        let mut threads = self.threads.write().await;
        let thread = threads.entry(Self::key(thread_id, org_id)).or_default();
        if !thread.iter().any(|m| m.id == id) {
            thread.push(message);
        }
        Ok(id)
    }

    async fn last_message(&self, thread_id: &str, org_id: &str) -> Result<Option<Message>, StoreError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(&Self::key(thread_id, org_id))
            .and_then(|t| t.last().cloned()))
    }

    async fn history(&self, thread_id: &str, org_id: &str) -> Result<Vec<Message>, StoreError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(&Self::key(thread_id, org_id))
            .cloned()
            .unwrap_or_default())
    }
}
