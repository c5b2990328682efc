use super::backend::{MemoryBackend, StorageBackend};
use crate::context::ContextId;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

const CHANGE_CAPACITY: usize = 256;

/// Notification that a key was rewritten, published after the write landed.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Value,
    pub origin: ContextId,
}

/// The storage area every context can reach.
///
/// Writes are last-writer-wins per key. Saving and publishing happen under
/// one lock so observers see changes in the same order the backend did.
pub struct StorageArea {
    backend: Arc<dyn StorageBackend>,
    changes: broadcast::Sender<StorageChange>,
    write_lock: Mutex<()>,
}

impl StorageArea {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Arc::new(Self {
            backend,
            changes,
            write_lock: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.backend.load(key).await
    }

    pub async fn set(&self, key: &str, value: Value, origin: ContextId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.backend.save(key, &value).await?;

        tracing::debug!("Storage key {} written by {}", key, origin);
        // Nobody listening is fine
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            new_value: value,
            origin,
        });
        Ok(())
    }

    /// Subscribe to changes written after this call
    pub fn watch(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_publishes_change_with_origin() {
        let area = StorageArea::in_memory();
        let mut changes = area.watch();

        area.set("recordingState", json!({"recordingState": "PENDING"}), ContextId::new(3))
            .await
            .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "recordingState");
        assert_eq!(change.origin, ContextId::new(3));
        assert_eq!(change.new_value, json!({"recordingState": "PENDING"}));
        assert_eq!(
            area.get("recordingState").await.unwrap(),
            Some(json!({"recordingState": "PENDING"}))
        );
    }

    #[tokio::test]
    async fn test_later_write_wins() {
        let area = StorageArea::in_memory();
        area.set("recordingTime", json!({"recordingTime": 1}), ContextId::new(1))
            .await
            .unwrap();
        area.set("recordingTime", json!({"recordingTime": 7}), ContextId::new(2))
            .await
            .unwrap();

        assert_eq!(
            area.get("recordingTime").await.unwrap(),
            Some(json!({"recordingTime": 7}))
        );
    }
}
