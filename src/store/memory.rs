use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::store::error::Result;
use crate::store::traits::QueueStore;
use crate::types::message::QueuedMessage;

/// Queue storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, Vec<QueuedMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn load(&self, room_id: &str) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .queues
            .lock()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, room_id: &str, messages: &[QueuedMessage]) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if messages.is_empty() {
            queues.remove(room_id);
        } else {
            queues.insert(room_id.to_string(), messages.to_vec());
        }
        Ok(())
    }

    async fn rooms(&self) -> Result<Vec<String>> {
        let mut rooms: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_empty_save_forgets_room() {
        let store = MemoryStore::new();
        let msg = QueuedMessage {
            local_id: "l1".into(),
            room_id: "dm".into(),
            text: "hi".into(),
            receiver_id: "bob".into(),
            created_at: Utc::now(),
            retry_count: 0,
        };
        store.save("dm", &[msg.clone()]).await.unwrap();
        assert_eq!(store.rooms().await.unwrap(), vec!["dm".to_string()]);
        assert_eq!(store.load("dm").await.unwrap(), vec![msg]);

        store.save("dm", &[]).await.unwrap();
        assert!(store.rooms().await.unwrap().is_empty());
        assert!(store.load("dm").await.unwrap().is_empty());
    }
}
