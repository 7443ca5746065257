//! The single call session and the resources it owns.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::sync::Arc;

use super::negotiation::Negotiation;
use super::peer::{LocalStream, MediaDevices, PeerConnection};
use super::state::{CallStatus, CallTransition, InvalidTransition, next_status};
use crate::timers::TimerSlot;
use crate::types::call::{CallId, CallRole, CallType, ConnectionQuality};

/// Every timer a session may have running.
#[derive(Debug, Default)]
pub(crate) struct SessionTimers {
    pub ring: TimerSlot,
    pub connect: TimerSlot,
    pub disconnect_grace: TimerSlot,
    pub reoffer: TimerSlot,
    pub quality: TimerSlot,
    pub transport_grace: TimerSlot,
}

impl SessionTimers {
    pub fn cancel_all(&mut self) {
        self.ring.cancel();
        self.connect.cancel();
        self.disconnect_grace.cancel();
        self.reoffer.cancel();
        self.quality.cancel();
        self.transport_grace.cancel();
    }

    pub fn cancel_connection_timers(&mut self) {
        self.connect.cancel();
        self.disconnect_grace.cancel();
        self.reoffer.cancel();
    }

    /// Handles of the timers still running.
    #[cfg(test)]
    pub fn live_handles(&self) -> Vec<tokio::task::AbortHandle> {
        [
            &self.ring,
            &self.connect,
            &self.disconnect_grace,
            &self.reoffer,
            &self.quality,
            &self.transport_grace,
        ]
        .into_iter()
        .filter(|slot| slot.is_armed())
        .filter_map(|slot| slot.handle())
        .collect()
    }
}

/// Read-only projection of a call handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub role: CallRole,
    pub room_id: Option<String>,
    pub call_type: CallType,
    pub remote_user_id: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub connection_quality: ConnectionQuality,
    pub reconnect_attempt: u32,
    pub ice_restart_attempt: u32,
    pub error: Option<String>,
}

pub(crate) struct CallSession {
    pub call_id: CallId,
    pub role: CallRole,
    pub room_id: Option<String>,
    pub call_type: CallType,
    pub remote_user_id: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub quality: ConnectionQuality,
    pub reconnect_attempt: u32,
    pub error: Option<String>,
    /// Accept is in flight with the lock released.
    pub accepting: bool,
    pub negotiation: Negotiation,
    pub timers: SessionTimers,
    local_media: Option<LocalStream>,
    peer: Option<Arc<dyn PeerConnection>>,
    rendering_remote: bool,
}

impl CallSession {
    pub fn outgoing(call_id: CallId, remote_user_id: &str, call_type: CallType) -> Self {
        Self::new(
            call_id,
            CallRole::Caller,
            None,
            remote_user_id,
            call_type,
            CallStatus::Calling,
        )
    }

    pub fn incoming(
        call_id: CallId,
        room_id: String,
        remote_user_id: &str,
        call_type: CallType,
    ) -> Self {
        Self::new(
            call_id,
            CallRole::Receiver,
            Some(room_id),
            remote_user_id,
            call_type,
            CallStatus::Ringing,
        )
    }

    fn new(
        call_id: CallId,
        role: CallRole,
        room_id: Option<String>,
        remote_user_id: &str,
        call_type: CallType,
        status: CallStatus,
    ) -> Self {
        Self {
            call_id,
            role,
            room_id,
            call_type,
            remote_user_id: remote_user_id.to_string(),
            status,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            quality: ConnectionQuality::Unknown,
            reconnect_attempt: 0,
            error: None,
            accepting: false,
            negotiation: Negotiation::default(),
            timers: SessionTimers::default(),
            local_media: None,
            peer: None,
            rendering_remote: false,
        }
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    pub fn apply(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        self.status = next_status(self.status, self.role, transition)?;
        if self.status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn attach_local_media(&mut self, stream: LocalStream) {
        self.local_media = Some(stream);
    }

    pub fn local_media(&self) -> Option<&LocalStream> {
        self.local_media.as_ref()
    }

    pub fn set_peer(&mut self, peer: Arc<dyn PeerConnection>) {
        self.peer = Some(peer);
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer.clone()
    }

    pub fn mark_rendering_remote(&mut self) {
        self.rendering_remote = true;
    }

    /// Release everything the session owns. Safe to call repeatedly; each
    /// resource is released at most once.
    pub async fn release(&mut self, media: &dyn MediaDevices) {
        self.timers.cancel_all();
        self.negotiation.clear();
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if self.rendering_remote {
            self.rendering_remote = false;
            media.release_remote().await;
        }
        if let Some(stream) = self.local_media.take() {
            debug!(target: "Call", "Releasing local media {} for call {}", stream.id, self.call_id);
            media.release_local(stream).await;
        }
    }

    pub fn duration_seconds(&self) -> i64 {
        match self.connected_at {
            Some(connected_at) => {
                let end = self.ended_at.unwrap_or_else(Utc::now);
                end.signed_duration_since(connected_at).num_seconds().max(0)
            }
            None => 0,
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            role: self.role,
            room_id: self.room_id.clone(),
            call_type: self.call_type,
            remote_user_id: self.remote_user_id.clone(),
            status: self.status,
            started_at: self.started_at,
            connected_at: self.connected_at,
            duration_seconds: self.duration_seconds(),
            connection_quality: self.quality,
            reconnect_attempt: self.reconnect_attempt,
            ice_restart_attempt: self.negotiation.ice_restart_attempt(),
            error: self.error.clone(),
        }
    }
}
