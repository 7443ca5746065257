//! Seams to the media pipeline and the peer connection.
//!
//! The session layer never captures, encodes or renders media itself. It
//! drives these traits, which a platform binds to its camera/microphone and
//! WebRTC stack. Everything here is owned by exactly one call session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::call::{CallId, CallType};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("malformed session description: {0}")]
    Malformed(String),

    #[error("peer connection error: {0}")]
    Peer(String),
}

/// Handle to captured local media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Local camera/microphone plus the remote renderer.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_local(&self, call_type: CallType) -> Result<LocalStream, MediaError>;

    async fn release_local(&self, stream: LocalStream);

    async fn render_remote(&self, track: RemoteTrack);

    async fn release_remote(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Reject descriptions that cannot possibly be applied.
    pub fn validate(&self) -> Result<(), NegotiationError> {
        if self.sdp.trim().is_empty() {
            return Err(NegotiationError::Malformed(format!(
                "empty {:?} description",
                self.kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    /// Blank candidates mark the end of gathering and carry nothing to apply.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// ICE/DTLS link state reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Transport statistics sampled by the quality monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub round_trip_time: Option<Duration>,
}

impl LinkStats {
    pub fn loss_ratio(&self) -> f64 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / total as f64
    }

    pub fn rtt_ms(&self) -> f64 {
        self.round_trip_time
            .map(|rtt| rtt.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    LinkStateChanged(LinkState),
    RemoteTrack(RemoteTrack),
}

/// Where a peer connection reports its events. Every event is tagged with
/// the call that owns the connection so late events of a finished call are
/// recognisable.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    call_id: CallId,
    tx: mpsc::UnboundedSender<(CallId, PeerEvent)>,
}

impl PeerEventSink {
    pub(crate) fn new(call_id: CallId, tx: mpsc::UnboundedSender<(CallId, PeerEvent)>) -> Self {
        Self { call_id, tx }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn emit(&self, event: PeerEvent) {
        // The receiver only goes away with the call manager.
        let _ = self.tx.send((self.call_id.clone(), event));
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn restart_ice(&self);

    async fn stats(&self) -> Result<LinkStats, NegotiationError>;

    fn link_state(&self) -> LinkState;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        local: &LocalStream,
        events: PeerEventSink,
    ) -> Result<std::sync::Arc<dyn PeerConnection>, NegotiationError>;
}
