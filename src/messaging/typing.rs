use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::protocol::{SignalEvent, Typing};
use crate::transport::{Transport, TransportError};
use crate::types::events::{Event, EventBus};

type PeerKey = (String, String);

/// Typing state in both directions.
///
/// Our own state goes out only on edges (started/stopped typing), never per
/// keystroke. A peer's indicator clears by itself after `timeout` without a
/// fresh `typing` event.
pub struct TypingIndicator {
    user_id: String,
    transport: Arc<dyn Transport>,
    event_bus: EventBus,
    timeout: Duration,
    local: DashMap<String, bool>,
    /// Generation of the latest `typing` event per (room, peer).
    remote: Arc<DashMap<PeerKey, u64>>,
    generation: AtomicU64,
}

impl TypingIndicator {
    pub fn new(
        user_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        event_bus: EventBus,
        timeout: Duration,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            transport,
            event_bus,
            timeout,
            local: DashMap::new(),
            remote: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Report our typing state for `room_id`. Returns whether anything was
    /// sent.
    pub async fn set_typing(
        &self,
        room_id: &str,
        receiver_id: &str,
        is_typing: bool,
    ) -> Result<bool, TransportError> {
        let previous = self
            .local
            .insert(room_id.to_string(), is_typing)
            .unwrap_or(false);
        if previous == is_typing {
            return Ok(false);
        }

        debug!(target: "Typing", "Sending typing={is_typing} to {receiver_id} in {room_id}");
        let event = SignalEvent::Typing(Typing {
            room_id: room_id.to_string(),
            user_id: self.user_id.clone(),
            receiver_id: receiver_id.to_string(),
            is_typing,
        });
        let result = match self.transport.send(event).await {
            Ok(ack) => match ack.error {
                None => Ok(true),
                Some(e) => Err(TransportError::Rejected(e)),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            // Roll back so the next change is treated as an edge again.
            warn!(target: "Typing", "Failed to send typing state: {e}");
            self.local.insert(room_id.to_string(), previous);
        }
        result
    }

    /// Apply a peer's `typing` event.
    pub fn handle_remote(&self, typing: &Typing) {
        let key = (typing.room_id.clone(), typing.user_id.clone());
        if !typing.is_typing {
            self.clear_remote(&typing.room_id, &typing.user_id);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let was_typing = self.remote.insert(key.clone(), generation).is_some();
        if !was_typing {
            self.emit(&key, true);
        }

        let remote = self.remote.clone();
        let event_bus = self.event_bus.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Only the latest refresh may clear the indicator.
            if remote.remove_if(&key, |_, g| *g == generation).is_some() {
                debug!(target: "Typing", "{} stopped typing in {} (timeout)", key.1, key.0);
                event_bus.dispatch(&Event::PeerTyping {
                    room_id: key.0,
                    user_id: key.1,
                    is_typing: false,
                });
            }
        });
    }

    /// Clear a peer's indicator, e.g. because their message arrived.
    pub fn clear_remote(&self, room_id: &str, user_id: &str) {
        let key = (room_id.to_string(), user_id.to_string());
        if self.remote.remove(&key).is_some() {
            self.emit(&key, false);
        }
    }

    pub fn is_peer_typing(&self, room_id: &str, user_id: &str) -> bool {
        self.remote
            .contains_key(&(room_id.to_string(), user_id.to_string()))
    }

    fn emit(&self, key: &PeerKey, is_typing: bool) {
        self.event_bus.dispatch(&Event::PeerTyping {
            room_id: key.0.clone(),
            user_id: key.1.clone(),
            is_typing,
        });
    }
}
