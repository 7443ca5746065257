use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a message as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Failed,
}

/// The user-visible projection of a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDisplay {
    /// Local id while unconfirmed, server id afterwards.
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

/// A chat message that has not been confirmed by the server yet.
///
/// Persisted per room so it survives process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub local_id: String,
    pub room_id: String,
    pub text: String,
    pub receiver_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedMessage {
    pub(crate) fn to_display(&self, sender_id: &str, status: MessageStatus) -> MessageDisplay {
        MessageDisplay {
            id: self.local_id.clone(),
            text: self.text.clone(),
            sender_id: sender_id.to_string(),
            timestamp: self.created_at,
            status,
        }
    }
}
