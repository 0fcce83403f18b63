// Persistence seam — the host application owns the real database
//
// The core only requires the operations below; `MemoryStore` is the
// reference implementation used by tests and the CLI.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("no message with id {0}")]
    NotFound(String),
}

/// A message as the host application persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned ID (UUID v4)
    pub id: String,
    pub message: String,
    pub sender: String,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// True when this device sent the message
    pub is_sent: bool,
    /// Source address for broadcast messages
    pub sender_ip: Option<String>,
}

impl StoredMessage {
    /// Record for a message received from a peer.
    pub fn received(sender: &str, message: &str, sender_ip: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.to_string(),
            sender: sender.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            is_sent: false,
            sender_ip,
        }
    }

    /// Record for a message this device sent.
    pub fn sent(message: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.to_string(),
            sender: "You".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            is_sent: true,
            sender_ip: None,
        }
    }
}

/// Interface the core consumes for message persistence.
pub trait MessageStore: Send + Sync {
    /// Persist a message, returning its ID.
    fn save(&self, message: &StoredMessage) -> Result<String, StoreError>;
    /// All messages, ordered by timestamp ascending.
    fn list(&self) -> Result<Vec<StoredMessage>, StoreError>;
    /// Delete everything.
    fn clear(&self) -> Result<(), StoreError>;
    /// Delete a single message by ID.
    fn delete(&self, id: &str) -> Result<(), StoreError>;
    /// Case-insensitive substring search over message text and sender.
    fn search(&self, query: &str) -> Result<Vec<StoredMessage>, StoreError>;
}

/// In-memory store for tests and the CLI.
#[derive(Clone, Default)]
pub struct MemoryStore {
    messages: Arc<RwLock<Vec<StoredMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn save(&self, message: &StoredMessage) -> Result<String, StoreError> {
        self.messages.write().push(message.clone());
        Ok(message.id.clone())
    }

    fn list(&self) -> Result<Vec<StoredMessage>, StoreError> {
        let mut messages = self.messages.read().clone();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.messages.write().clear();
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn search(&self, query: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let needle = query.to_lowercase();
        let mut hits: Vec<StoredMessage> = self
            .messages
            .read()
            .iter()
            .filter(|m| {
                m.message.to_lowercase().contains(&needle)
                    || m.sender.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by_key(|m| m.timestamp);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_list_ordered() {
        let store = MemoryStore::new();
        let mut a = StoredMessage::received("alice", "first", None);
        a.timestamp = 100;
        let mut b = StoredMessage::received("bob", "second", None);
        b.timestamp = 50;

        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "second");
        assert_eq!(all[1].message, "first");
    }

    #[test]
    fn test_clear() {
        let store = MemoryStore::new();
        store
            .save(&StoredMessage::received("alice", "hi", None))
            .unwrap();
        store.clear().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_by_id() {
        let store = MemoryStore::new();
        let msg = StoredMessage::received("alice", "hi", None);
        let id = store.save(&msg).unwrap();

        store.delete(&id).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let store = MemoryStore::new();
        store
            .save(&StoredMessage::received("Alice", "Lunch at noon", None))
            .unwrap();
        store
            .save(&StoredMessage::received("bob", "other", None))
            .unwrap();

        assert_eq!(store.search("lunch").unwrap().len(), 1);
        assert_eq!(store.search("ALICE").unwrap().len(), 1);
        assert!(store.search("nothing").unwrap().is_empty());
    }
}
