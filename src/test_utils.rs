use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::{Ack, SignalEvent};
use crate::transport::{Transport, TransportError};
use crate::types::events::Event;

/// Transport that records every outbound event and acknowledges it the way
/// the server would.
pub struct RecordingTransport {
    sent: Mutex<Vec<SignalEvent>>,
    failing: Mutex<HashSet<&'static str>>,
    stalls: Mutex<HashMap<&'static str, Duration>>,
    interrupts: Mutex<HashMap<&'static str, Duration>>,
    connected: AtomicBool,
    room_id: String,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::with_room("room-1")
    }

    pub fn with_room(room_id: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            stalls: Mutex::new(HashMap::new()),
            interrupts: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            room_id: room_id.to_string(),
        }
    }

    pub fn sent(&self) -> Vec<SignalEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, kind: &str) -> Vec<SignalEvent> {
        self.sent()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent_of(kind).len()
    }

    /// Make sends of `kind` fail until [`Self::heal`] is called.
    pub fn fail(&self, kind: &'static str) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn heal(&self, kind: &'static str) {
        self.failing.lock().unwrap().remove(kind);
    }

    /// Delay every send of `kind` by `delay` before it is acknowledged.
    pub fn stall(&self, kind: &'static str, delay: Duration) {
        self.stalls.lock().unwrap().insert(kind, delay);
    }

    /// The next send of `kind` hangs for `after` and then fails as if the
    /// connection dropped underneath it.
    pub fn interrupt_next(&self, kind: &'static str, after: Duration) {
        self.interrupts.lock().unwrap().insert(kind, after);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, event: SignalEvent) -> Result<Ack, TransportError> {
        let kind = event.kind();
        self.sent.lock().unwrap().push(event.clone());
        let interrupt = self.interrupts.lock().unwrap().remove(kind);
        if let Some(after) = interrupt {
            tokio::time::sleep(after).await;
            return Err(TransportError::Disconnected);
        }
        let stall = self.stalls.lock().unwrap().get(kind).copied();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if self.failing.lock().unwrap().contains(kind) {
            return Err(TransportError::Timeout);
        }
        Ok(match event {
            SignalEvent::InitiateCall(_) => Ack::room(self.room_id.clone()),
            SignalEvent::SendMessage(m) => Ack::message(format!("srv-{}", m.local_id)),
            _ => Ack::ok(),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
