use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::calls::CallSnapshot;
use crate::types::call::{CallId, CallType, ConnectionQuality, EndReason};
use crate::types::message::MessageDisplay;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingCallInfo {
    pub call_id: CallId,
    pub room_id: String,
    pub caller_id: String,
    pub call_type: CallType,
}

/// A call we could not take because another one was in progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissedCall {
    pub call_id: CallId,
    pub caller_id: String,
    pub call_type: CallType,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEnded {
    pub call: CallSnapshot,
    pub reason: EndReason,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRejected {
    pub call: CallSnapshot,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Reconnected,

    CallStatusChanged(CallSnapshot),
    IncomingCall(IncomingCallInfo),
    MissedCall(MissedCall),
    CallConnected(CallSnapshot),
    /// The media link dropped and an ICE restart is under way.
    CallReconnecting(CallSnapshot),
    QualityChanged {
        call_id: CallId,
        quality: ConnectionQuality,
    },
    CallEnded(CallEnded),
    CallRejected(CallRejected),
    CallBusy { call_id: CallId },
    CallTimeout { call_id: CallId },

    /// A listed message was inserted or changed. `previous_id` is the id it
    /// was listed under before this change (the local id on confirmation).
    MessageUpdated {
        room_id: String,
        previous_id: String,
        message: MessageDisplay,
    },
    MessageReceived {
        room_id: String,
        message: MessageDisplay,
    },
    MessageRemoved {
        room_id: String,
        id: String,
    },
    PeerTyping {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },
}

/// Handlers run synchronously on the dispatching task and must not block.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

struct ChannelHandler(mpsc::UnboundedSender<Event>);

impl EventHandler for ChannelHandler {
    fn handle_event(&self, event: &Event) {
        let _ = self.0.send(event.clone());
    }
}

#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    /// Receive every future event on a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_handler(Arc::new(ChannelHandler(tx)));
        rx
    }

    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("has_handlers", &self.has_handlers())
            .finish()
    }
}
