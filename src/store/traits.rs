use async_trait::async_trait;

use super::error::Result;
use crate::types::message::QueuedMessage;

/// Per-room persistence of the outbound message queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Messages queued for `room_id`, oldest first. Empty when none.
    async fn load(&self, room_id: &str) -> Result<Vec<QueuedMessage>>;

    /// Replace the queue of `room_id`. An empty slice removes it.
    async fn save(&self, room_id: &str, messages: &[QueuedMessage]) -> Result<()>;

    /// Rooms that currently have queued messages.
    async fn rooms(&self) -> Result<Vec<String>>;
}
