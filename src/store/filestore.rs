use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::store::error::{Result, StoreError};
use crate::store::traits::QueueStore;
use crate::types::message::QueuedMessage;

/// On-disk shape of one room's queue. The file name is the hex-encoded room
/// id; the id also travels inside the document as a check.
#[derive(Serialize, Deserialize)]
struct RoomQueue {
    room_id: String,
    messages: Vec<QueuedMessage>,
}

pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        let store = Self { base_path };

        fs::create_dir_all(store.path_for("queue")).await?;

        Ok(store)
    }

    fn path_for(&self, sub: &str) -> PathBuf {
        self.base_path.join(sub)
    }

    /// Hex of the room id, so distinct rooms never share a file.
    fn encode_filename(room_id: &str) -> String {
        hex::encode(room_id.as_bytes())
    }

    fn queue_path(&self, room_id: &str) -> PathBuf {
        self.path_for("queue")
            .join(format!("{}.json", Self::encode_filename(room_id)))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        // Replaced atomically via rename.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await.map_err(StoreError::from)
    }
}

#[async_trait]
impl QueueStore for FileStore {
    async fn load(&self, room_id: &str) -> Result<Vec<QueuedMessage>> {
        let Some(queue) = self
            .read_json::<RoomQueue>(&self.queue_path(room_id))
            .await?
        else {
            return Ok(Vec::new());
        };
        if queue.room_id != room_id {
            return Err(StoreError::RoomMismatch {
                expected: room_id.to_string(),
                found: queue.room_id,
            });
        }
        Ok(queue.messages)
    }

    async fn save(&self, room_id: &str, messages: &[QueuedMessage]) -> Result<()> {
        let path = self.queue_path(room_id);
        if messages.is_empty() {
            debug!(target: "Store", "Queue for {room_id} is empty, removing {}", path.display());
            return fs::remove_file(path)
                .await
                .or_else(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        Ok(())
                    } else {
                        Err(e)
                    }
                })
                .map_err(StoreError::from);
        }
        let queue = RoomQueue {
            room_id: room_id.to_string(),
            messages: messages.to_vec(),
        };
        self.write_json(&path, &queue).await
    }

    async fn rooms(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.path_for("queue")).await?;
        let mut rooms = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // One bad file must not hide the queues of every other room.
            let queue = match self.read_json::<RoomQueue>(&path).await {
                Ok(Some(queue)) => queue,
                Ok(None) => continue,
                Err(e) => {
                    warn!(target: "Store", "Skipping unreadable queue file {}: {e}", path.display());
                    continue;
                }
            };
            if path.file_stem().and_then(|s| s.to_str())
                != Some(Self::encode_filename(&queue.room_id).as_str())
            {
                warn!(
                    target: "Store",
                    "Skipping {}: it holds room {}",
                    path.display(),
                    queue.room_id
                );
                continue;
            }
            if !queue.messages.is_empty() {
                rooms.push(queue.room_id);
            }
        }
        rooms.sort();
        Ok(rooms)
    }
}
