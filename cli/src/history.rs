// JSON-file message history — the host-application side of the core's
// persistence seam.

use roomcast_core::store::{MessageStore, StoreError, StoredMessage};
use std::path::PathBuf;
use std::sync::Mutex;

pub struct FileStore {
    path: PathBuf,
    messages: Mutex<Vec<StoredMessage>>,
}

impl FileStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let messages = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| StoreError::Storage(e.to_string()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            messages: Mutex::new(messages),
        })
    }

    fn flush(&self, messages: &[StoredMessage]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(messages)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|e| StoreError::Storage(e.to_string()))
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, Vec<StoredMessage>>, StoreError> {
        self.messages
            .lock()
            .map_err(|_| StoreError::Storage("history lock poisoned".to_string()))
    }
}

impl MessageStore for FileStore {
    fn save(&self, message: &StoredMessage) -> Result<String, StoreError> {
        let mut messages = self.locked()?;
        messages.push(message.clone());
        self.flush(&messages)?;
        Ok(message.id.clone())
    }

    fn list(&self) -> Result<Vec<StoredMessage>, StoreError> {
        let mut messages = self.locked()?.clone();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut messages = self.locked()?;
        messages.clear();
        self.flush(&messages)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut messages = self.locked()?;
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.flush(&messages)
    }

    fn search(&self, query: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let needle = query.to_lowercase();
        let mut hits: Vec<StoredMessage> = self
            .locked()?
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
