//! In-process stand-ins for the signaling server, the capture devices and
//! the WebRTC stack.
//!
//! [`LoopbackHub`] plays the server: it allocates signaling rooms, relays
//! call and negotiation events between the two members of a room, assigns
//! server ids to chat messages and echoes them back to the sender. Users can
//! be taken offline to exercise the reconnect paths. [`SimulatedMedia`] and
//! [`SimulatedPeerFactory`] record what they were asked to do so callers can
//! check that every resource was released.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::calls::{
    IceCandidate, IceServer, LinkState, LinkStats, LocalStream, MediaDevices, MediaError,
    NegotiationError, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    RemoteTrack, SessionDescription, TrackKind,
};
use crate::protocol::{Ack, CallControl, ChatMessage, IncomingCall, SignalEvent};
use crate::transport::{Transport, TransportError, TransportEvent};
use crate::types::call::CallType;

struct UserLink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    online: Arc<AtomicBool>,
}

/// Room membership: `(caller, callee)`.
type Members = (String, String);

/// A signaling server that lives in the current process.
#[derive(Default)]
pub struct LoopbackHub {
    users: DashMap<String, UserLink>,
    rooms: DashMap<String, Members>,
    next_room: AtomicU64,
    next_message: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a user and hand back its transport plus the stream of
    /// inbound transport events.
    pub fn connect(
        self: &Arc<Self>,
        user_id: &str,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(true));
        let _ = tx.send(TransportEvent::Connected);
        let _ = tx.send(TransportEvent::Authenticated);
        self.users.insert(
            user_id.to_string(),
            UserLink {
                tx,
                online: online.clone(),
            },
        );
        let transport = Arc::new(LoopbackTransport {
            user_id: user_id.to_string(),
            hub: self.clone(),
            online,
        });
        (transport, rx)
    }

    /// Take a user offline or bring it back.
    pub fn set_online(&self, user_id: &str, online: bool) {
        let Some(link) = self.users.get(user_id) else {
            return;
        };
        if link.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let event = if online {
            TransportEvent::Reconnected
        } else {
            TransportEvent::Disconnected
        };
        let _ = link.tx.send(event);
    }

    fn deliver(&self, user_id: &str, event: SignalEvent) {
        match self.users.get(user_id) {
            Some(link) if link.online.load(Ordering::SeqCst) => {
                let _ = link.tx.send(TransportEvent::Received(event));
            }
            _ => debug!(target: "Client", "Dropping {} for offline user {user_id}", event.kind()),
        }
    }

    /// The other member of `room_id`.
    fn peer_of(&self, room_id: &str, user_id: &str) -> Option<String> {
        let members = self.rooms.get(room_id)?;
        let (a, b) = members.value();
        if a == user_id {
            Some(b.clone())
        } else if b == user_id {
            Some(a.clone())
        } else {
            None
        }
    }

    fn relay(&self, room_id: &str, from: &str, event: SignalEvent) -> Result<Ack, TransportError> {
        let Some(peer) = self.peer_of(room_id, from) else {
            return Ok(Ack::error(format!("unknown room {room_id}")));
        };
        self.deliver(&peer, event);
        Ok(Ack::ok())
    }

    fn route(&self, from: &str, event: SignalEvent) -> Result<Ack, TransportError> {
        match event {
            SignalEvent::InitiateCall(request) => {
                let room_id = format!("room-{}", self.next_room.fetch_add(1, Ordering::SeqCst) + 1);
                self.rooms.insert(
                    room_id.clone(),
                    (request.caller_id.clone(), request.target_id.clone()),
                );
                self.deliver(
                    &request.target_id,
                    SignalEvent::IncomingCall(IncomingCall {
                        call_id: request.call_id,
                        room_id: room_id.clone(),
                        caller_id: request.caller_id,
                        call_type: request.call_type,
                    }),
                );
                Ok(Ack::room(room_id))
            }
            SignalEvent::AnswerCall(c) => {
                let room_id = c.room_id.clone();
                self.relay(&room_id, from, SignalEvent::CallAnswered(c))
            }
            SignalEvent::RejectCall(c) => {
                let room_id = c.room_id.clone();
                let ack = self.relay(&room_id, from, SignalEvent::CallRejected(c));
                self.rooms.remove(&room_id);
                ack
            }
            SignalEvent::EndCall(CallControl {
                call_id,
                room_id,
                from: sender,
                reason,
            }) => {
                let ended = SignalEvent::CallEnded(CallControl {
                    call_id,
                    room_id: room_id.clone(),
                    from: sender,
                    reason,
                });
                let ack = self.relay(&room_id, from, ended);
                self.rooms.remove(&room_id);
                ack
            }
            SignalEvent::WebrtcOffer(ref p) | SignalEvent::WebrtcAnswer(ref p) => {
                let room_id = p.room_id.clone();
                self.relay(&room_id, from, event)
            }
            SignalEvent::WebrtcIce(ref p) => {
                let room_id = p.room_id.clone();
                self.relay(&room_id, from, event)
            }
            SignalEvent::SendMessage(m) => {
                let id = format!("msg-{}", self.next_message.fetch_add(1, Ordering::SeqCst) + 1);
                let message = SignalEvent::Message(ChatMessage {
                    id: id.clone(),
                    room_id: m.room_id,
                    sender_id: m.sender_id,
                    text: m.text,
                    timestamp: Utc::now(),
                });
                self.deliver(&m.receiver_id, message.clone());
                // Room broadcast includes the sender.
                self.deliver(from, message);
                Ok(Ack::message(id))
            }
            SignalEvent::Typing(ref t) => {
                let receiver = t.receiver_id.clone();
                self.deliver(&receiver, event);
                Ok(Ack::ok())
            }
            SignalEvent::MarkRead(ref r) => {
                let receiver = r.receiver_id.clone();
                self.deliver(&receiver, event);
                Ok(Ack::ok())
            }
            other => {
                warn!(target: "Client", "Clients do not send {}", other.kind());
                Ok(Ack::error(format!("unexpected event {}", other.kind())))
            }
        }
    }
}

pub struct LoopbackTransport {
    user_id: String,
    hub: Arc<LoopbackHub>,
    online: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, event: SignalEvent) -> Result<Ack, TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.hub.route(&self.user_id, event)
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Capture devices that hand out numbered streams.
#[derive(Debug, Default)]
pub struct SimulatedMedia {
    deny: AtomicBool,
    next_id: AtomicU64,
    active: Mutex<Vec<LocalStream>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    rendering: AtomicBool,
}

impl SimulatedMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent acquisitions fail as if the user refused access.
    pub fn set_permission_denied(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn active_streams(&self) -> usize {
        self.active.lock().expect("Mutex should not be poisoned").len()
    }

    pub fn is_rendering(&self) -> bool {
        self.rendering.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for SimulatedMedia {
    async fn acquire_local(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(format!(
                "{call_type} capture refused"
            )));
        }
        let stream = LocalStream {
            id: format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            audio: true,
            video: call_type.has_video(),
        };
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.active
            .lock()
            .expect("Mutex should not be poisoned")
            .push(stream.clone());
        Ok(stream)
    }

    async fn release_local(&self, stream: LocalStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.active
            .lock()
            .expect("Mutex should not be poisoned")
            .retain(|s| s.id != stream.id);
    }

    async fn render_remote(&self, _track: RemoteTrack) {
        self.rendering.store(true, Ordering::SeqCst);
    }

    async fn release_remote(&self) {
        self.rendering.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    link: LinkState,
    applied: Vec<IceCandidate>,
    offers: u32,
    restarts: u32,
    track_sent: bool,
    closed: bool,
    stats: LinkStats,
}

/// A peer connection that "connects" once both descriptions are in place.
#[derive(Debug)]
pub struct SimulatedPeer {
    label: usize,
    video: bool,
    events: PeerEventSink,
    auto_connect: bool,
    state: Mutex<PeerState>,
}

impl SimulatedPeer {
    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    /// Force a link state change, as the ICE agent would.
    pub fn set_link_state(&self, link: LinkState) {
        self.lock().link = link;
        self.events.emit(PeerEvent::LinkStateChanged(link));
    }

    pub fn set_stats(&self, stats: LinkStats) {
        self.lock().stats = stats;
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.lock().offers
    }

    pub fn restarts(&self) -> u32 {
        self.lock().restarts
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn has_remote_description(&self) -> bool {
        self.lock().remote.is_some()
    }

    fn check_open(&self) -> Result<(), NegotiationError> {
        if self.lock().closed {
            return Err(NegotiationError::Peer("connection closed".into()));
        }
        Ok(())
    }

    fn maybe_connect(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            if !self.auto_connect
                || state.closed
                || state.link == LinkState::Connected
                || state.local.is_none()
                || state.remote.is_none()
            {
                return;
            }
            state.link = LinkState::Connected;
            events.push(PeerEvent::LinkStateChanged(LinkState::Checking));
            events.push(PeerEvent::LinkStateChanged(LinkState::Connected));
            if !state.track_sent {
                state.track_sent = true;
                events.push(PeerEvent::RemoteTrack(RemoteTrack {
                    id: format!("remote-{}", self.label),
                    kind: if self.video {
                        TrackKind::Video
                    } else {
                        TrackKind::Audio
                    },
                }));
            }
        }
        for event in events {
            self.events.emit(event);
        }
    }

    fn description(&self, kind: &str, ice_restart: bool, version: u32) -> String {
        let mut sdp = format!(
            "v=0\r\no=sim {} {version} IN IP4 127.0.0.1\r\ns={kind}\r\n",
            self.label
        );
        if ice_restart {
            sdp.push_str("a=ice-options:restart\r\n");
        }
        sdp
    }
}

#[async_trait]
impl PeerConnection for SimulatedPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        self.check_open()?;
        let version = {
            let mut state = self.lock();
            state.offers += 1;
            state.offers
        };
        Ok(SessionDescription::offer(
            self.description("offer", ice_restart, version),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.check_open()?;
        if self.lock().remote.is_none() {
            return Err(NegotiationError::Peer("no remote offer".into()));
        }
        Ok(SessionDescription::answer(self.description("answer", false, 1)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.lock().local = Some(desc);
        self.events.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.label,
                50000 + self.label
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.lock().remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.check_open()?;
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(NegotiationError::Peer(
                "candidate before remote description".into(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn restart_ice(&self) {
        let mut state = self.lock();
        state.restarts += 1;
        state.link = LinkState::Checking;
        state.remote = None;
    }

    async fn stats(&self) -> Result<LinkStats, NegotiationError> {
        self.check_open()?;
        Ok(self.lock().stats)
    }

    fn link_state(&self) -> LinkState {
        self.lock().link
    }

    async fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.link = LinkState::Closed;
    }
}

/// Builds [`SimulatedPeer`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct SimulatedPeerFactory {
    auto_connect: bool,
    peers: Mutex<Vec<Arc<SimulatedPeer>>>,
}

impl SimulatedPeerFactory {
    /// With `auto_connect` the link comes up as soon as offer and answer
    /// have both been applied; otherwise tests drive it by hand.
    pub fn new(auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_connect,
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn peers(&self) -> Vec<Arc<SimulatedPeer>> {
        self.peers.lock().expect("Mutex should not be poisoned").clone()
    }

    pub fn last(&self) -> Option<Arc<SimulatedPeer>> {
        self.peers
            .lock()
            .expect("Mutex should not be poisoned")
            .last()
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for SimulatedPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        local: &LocalStream,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut peers = self.peers.lock().expect("Mutex should not be poisoned");
        debug!(
            target: "Call/Negotiation",
            "Creating peer for call {} with {} ICE servers",
            events.call_id(),
            ice_servers.len()
        );
        let peer = Arc::new(SimulatedPeer {
            label: peers.len() + 1,
            video: local.video,
            events,
            auto_connect: self.auto_connect,
            state: Mutex::new(PeerState {
                local: None,
                remote: None,
                link: LinkState::New,
                applied: Vec::new(),
                offers: 0,
                restarts: 0,
                track_sent: false,
                closed: false,
                stats: LinkStats::default(),
            }),
        });
        peers.push(peer.clone());
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InitiateCall, OutgoingMessage};
    use crate::types::call::CallId;

    #[tokio::test]
    async fn test_hub_allocates_rooms_and_relays() {
        let hub = LoopbackHub::new();
        let (alice, _alice_rx) = hub.connect("alice");
        let (_bob, mut bob_rx) = hub.connect("bob");
        assert_eq!(bob_rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(bob_rx.recv().await, Some(TransportEvent::Authenticated));

        let ack = alice
            .send(SignalEvent::InitiateCall(InitiateCall {
                call_id: CallId::new("C1"),
                caller_id: "alice".into(),
                target_id: "bob".into(),
                call_type: CallType::Audio,
            }))
            .await
            .unwrap();
        assert_eq!(ack.room_id.as_deref(), Some("room-1"));

        match bob_rx.recv().await {
            Some(TransportEvent::Received(SignalEvent::IncomingCall(call))) => {
                assert_eq!(call.room_id, "room-1");
                assert_eq!(call.caller_id, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_user_cannot_send() {
        let hub = LoopbackHub::new();
        let (alice, mut rx) = hub.connect("alice");
        hub.set_online("alice", false);
        assert!(!alice.is_connected());

        let result = alice
            .send(SignalEvent::SendMessage(OutgoingMessage {
                local_id: "l1".into(),
                room_id: "dm".into(),
                sender_id: "alice".into(),
                receiver_id: "bob".into(),
                text: "hi".into(),
            }))
            .await;
        assert_eq!(result, Err(TransportError::Disconnected));

        rx.recv().await;
        rx.recv().await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_media_tracks_active_streams() {
        let media = SimulatedMedia::new();
        let stream = media.acquire_local(CallType::Video).await.unwrap();
        assert!(stream.video);
        assert_eq!(media.active_streams(), 1);
        media.release_local(stream).await;
        assert_eq!(media.active_streams(), 0);

        media.set_permission_denied(true);
        assert!(matches!(
            media.acquire_local(CallType::Audio).await,
            Err(MediaError::PermissionDenied(_))
        ));
    }
}
