//! Conversation persistence.
//!
//! The engine loads a conversation at the start of a session and saves it
//! after each turn. The storage backend is a collaborator; an in-memory
//! implementation ships for tests and ephemeral runs.

use crate::error::Result;
use crate::message::{Conversation, ConversationId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Load/save contract for conversation state.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation, or `Ok(None)` if it does not exist.
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    /// Persist a conversation, replacing any previous snapshot.
    async fn save(&self, conversation: &Conversation) -> Result<()>;
}

/// In-memory store backed by a `HashMap`.
pub struct InMemoryStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let map = self.conversations.read().await;
        Ok(map.get(id).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let mut map = self.conversations.write().await;
        map.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let store = InMemoryStore::new();
        let mut conv = Conversation::new();
        conv.push(Message::user("hello"));
        store.save(&conv).await.unwrap();

        let loaded = store.load(&conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn missing_conversation_is_none() {
        let store = InMemoryStore::new();
        let loaded = store.load(&ConversationId::from("nope")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_replaces_previous_snapshot() {
        let store = InMemoryStore::new();
        let mut conv = Conversation::new();
        conv.push(Message::user("v1"));
        store.save(&conv).await.unwrap();
        conv.push(Message::assistant("v2"));
        store.save(&conv).await.unwrap();

        let loaded = store.load(&conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
