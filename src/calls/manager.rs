//! Call manager for orchestrating call lifecycle.
//!
//! The manager owns the single call session. User operations, inbound
//! signaling, peer-connection events and timer firings all take the session
//! lock, so every transition is atomic with respect to the others. The slow
//! parts of starting and accepting a call (media acquisition, room
//! allocation) run with the lock released and re-validate the session before
//! committing. Network sends never happen under the lock: control events
//! are spawned, and negotiation messages are queued for an outbound task that
//! delivers them in order.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::CallError;
use super::peer::{
    LinkState, MediaDevices, MediaError, NegotiationError, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerEventSink, SessionDescription,
};
use super::quality::classify_stats;
use super::session::{CallSession, CallSnapshot};
use super::state::{CallStatus, CallTransition, InvalidTransition};
use crate::config::CallConfig;
use crate::protocol::{
    Ack, CallControl, IcePayload, IncomingCall, InitiateCall, SdpPayload, SignalEvent,
};
use crate::transport::Transport;
use crate::types::call::{CallId, CallRole, CallType, EndReason};
use crate::types::events::{
    CallEnded, CallRejected, Event, EventBus, IncomingCallInfo, MissedCall,
};

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Ring,
    /// Tagged with the restart attempt it guards so stale firings are ignored.
    Connect { attempt: u32 },
    DisconnectGrace,
    Reoffer,
    TransportGrace,
}

fn current<'a>(
    slot: &'a mut Option<CallSession>,
    call_id: &CallId,
) -> Option<&'a mut CallSession> {
    slot.as_mut().filter(|s| s.call_id == *call_id)
}

/// The session a room-scoped event belongs to, if any.
fn session_for<'a>(
    slot: &'a mut Option<CallSession>,
    call_id: &CallId,
    room_id: &str,
) -> Option<&'a mut CallSession> {
    slot.as_mut()
        .filter(|s| s.call_id == *call_id && s.room_id.as_deref() == Some(room_id))
}

/// Manages the call session and its state transitions.
pub struct CallManager {
    user_id: String,
    config: CallConfig,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    event_bus: EventBus,
    session: Mutex<Option<CallSession>>,
    peer_events: mpsc::UnboundedSender<(CallId, PeerEvent)>,
    outbound: mpsc::UnboundedSender<SignalEvent>,
    weak_self: Weak<CallManager>,
}

impl CallManager {
    /// Create a new call manager. Must be called inside a tokio runtime.
    pub fn new(
        user_id: impl Into<String>,
        config: CallConfig,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        event_bus: EventBus,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::pump_negotiation(transport.clone(), outbound_rx));
        let manager = Arc::new_cyclic(|weak| Self {
            user_id: user_id.into(),
            config,
            transport,
            media,
            peers,
            event_bus,
            session: Mutex::new(None),
            peer_events: tx,
            outbound,
            weak_self: weak.clone(),
        });
        tokio::spawn(Self::pump_peer_events(Arc::downgrade(&manager), rx));
        manager
    }

    async fn pump_peer_events(
        weak: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<(CallId, PeerEvent)>,
    ) {
        while let Some((call_id, event)) = rx.recv().await {
            let Some(manager) = weak.upgrade() else {
                break;
            };
            manager.handle_peer_event(&call_id, event).await;
        }
    }

    /// Negotiation messages go out once, in the order they were queued; the
    /// re-offer and ICE restarts cover losses.
    async fn pump_negotiation(
        transport: Arc<dyn Transport>,
        mut rx: mpsc::UnboundedReceiver<SignalEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let kind = event.kind();
            match transport.send(event).await {
                Ok(ack) if ack.is_ok() => {}
                Ok(ack) => warn!(target: "Call/Negotiation", "{kind} rejected: {:?}", ack.error),
                Err(e) => warn!(target: "Call/Negotiation", "Failed to send {kind}: {e}"),
            }
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Snapshot of the current call, `None` when idle.
    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.lock().await.as_ref().map(CallSession::snapshot)
    }

    pub async fn status(&self) -> CallStatus {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub async fn has_active_call(&self) -> bool {
        self.session.lock().await.is_some()
    }

    // ==================== User operations ====================

    /// Start an outgoing call. Valid only while idle.
    pub async fn start_call(
        &self,
        target_id: &str,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        let call_id = CallId::generate();
        {
            let mut slot = self.session.lock().await;
            if slot.is_some() {
                return Err(CallError::Busy);
            }
            let session = CallSession::outgoing(call_id.clone(), target_id, call_type);
            info!(target: "Call", "Starting {call_type} call {call_id} to {target_id}");
            self.emit_status(&session);
            *slot = Some(session);
        }

        let stream = match self.media.acquire_local(call_type).await {
            Ok(stream) => stream,
            Err(e) => {
                let error = CallError::Media(e);
                self.abort_pending(&call_id, error.clone()).await;
                return Err(error);
            }
        };
        {
            let mut slot = self.session.lock().await;
            match current(&mut slot, &call_id) {
                Some(session) => session.attach_local_media(stream),
                None => {
                    drop(slot);
                    self.media.release_local(stream).await;
                    return Err(CallError::Cancelled);
                }
            }
        }

        let request = SignalEvent::InitiateCall(InitiateCall {
            call_id: call_id.clone(),
            caller_id: self.user_id.clone(),
            target_id: target_id.to_string(),
            call_type,
        });
        let room_id = match self.send_control(request).await {
            Ok(Ack {
                room_id: Some(room_id),
                ..
            }) => room_id,
            Ok(_) => {
                let error = CallError::Signaling("no signaling room granted".into());
                self.abort_pending(&call_id, error.clone()).await;
                return Err(error);
            }
            Err(error) => {
                self.abort_pending(&call_id, error.clone()).await;
                return Err(error);
            }
        };

        let mut slot = self.session.lock().await;
        let Some(session) = current(&mut slot, &call_id) else {
            // Hung up while the room was being allocated; the callee may
            // already be ringing.
            self.notify_peer(SignalEvent::EndCall(CallControl {
                call_id,
                room_id,
                from: self.user_id.clone(),
                reason: Some(EndReason::Hangup),
            }));
            return Err(CallError::Cancelled);
        };
        debug!(target: "Call", "Call {call_id} got room {room_id}");
        session.room_id = Some(room_id);
        session.apply(CallTransition::RoomAllocated)?;
        self.arm_ring_timer(session);
        self.emit_status(session);

        if let Err(error) = self.send_offer(session, false).await {
            self.fail(&mut slot, error.clone()).await;
            return Err(error);
        }
        Ok(call_id)
    }

    /// Accept the ringing incoming call.
    ///
    /// If local media cannot be acquired the call keeps ringing so the user
    /// can retry after granting permission.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (call_id, call_type, control) = {
            let mut slot = self.session.lock().await;
            let session = slot.as_mut().ok_or(CallError::NoActiveCall)?;
            if session.role != CallRole::Receiver
                || session.status != CallStatus::Ringing
                || session.accepting
            {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", session.status),
                    attempted: "LocalAccepted".to_string(),
                }
                .into());
            }
            let Some(control) = self.control(session, None) else {
                return Err(CallError::Signaling("incoming call has no room".into()));
            };
            session.accepting = true;
            (session.call_id.clone(), session.call_type, control)
        };

        let stream = match self.media.acquire_local(call_type).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "Call", "Cannot accept call {call_id}: {e}");
                self.reset_accepting(&call_id).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.send_control(SignalEvent::AnswerCall(control)).await {
            self.media.release_local(stream).await;
            self.reset_accepting(&call_id).await;
            return Err(e);
        }

        let mut slot = self.session.lock().await;
        let Some(session) = current(&mut slot, &call_id) else {
            drop(slot);
            self.media.release_local(stream).await;
            return Err(CallError::Cancelled);
        };
        session.accepting = false;
        session.attach_local_media(stream);
        session.apply(CallTransition::LocalAccepted)?;
        session.timers.ring.cancel();
        self.arm_connect_timer(session);
        info!(target: "Call", "Accepted call {call_id}");
        self.emit_status(session);

        let result = match self.ensure_peer(session).await {
            Ok(_) => match session.negotiation.take_buffered_offer() {
                Some(offer) => self.answer_offer(session, offer).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        };
        if let Err(error) = result {
            self.fail(&mut slot, error.clone()).await;
            return Err(error);
        }
        Ok(())
    }

    /// Decline (or cancel) the current call. A no-op when idle.
    pub async fn decline_call(&self, reason: EndReason) -> Result<(), CallError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            debug!(target: "Call", "decline_call with no active call");
            return Ok(());
        };
        let control = self.control(session, Some(reason));
        if let Some(call) = self
            .finish(&mut slot, CallTransition::Declined { reason }, None)
            .await
        {
            if let Some(control) = control {
                self.notify_peer(SignalEvent::RejectCall(control));
            }
            self.emit(Event::CallRejected(CallRejected { call, reason }));
        }
        Ok(())
    }

    /// Hang up the current call. A no-op when idle.
    pub async fn hang_up(&self, reason: EndReason) -> Result<(), CallError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            debug!(target: "Call", "hang_up with no active call");
            return Ok(());
        };
        let control = self.control(session, Some(reason));
        if let Some(call) = self
            .finish(&mut slot, CallTransition::Terminated { reason }, None)
            .await
        {
            if let Some(control) = control {
                self.notify_peer(SignalEvent::EndCall(control));
            }
            self.emit(Event::CallEnded(CallEnded {
                call,
                reason,
                error: None,
            }));
        }
        Ok(())
    }

    /// Application teardown: end whatever call is live.
    pub async fn teardown(&self) {
        let _ = self.hang_up(EndReason::Hangup).await;
    }

    // ==================== Inbound signaling ====================

    pub async fn handle_signal(&self, event: SignalEvent) {
        if event.sender() == self.user_id {
            debug!(target: "Call", "Ignoring self-echo {}", event.kind());
            return;
        }
        match event {
            SignalEvent::IncomingCall(call) => self.on_incoming_call(call).await,
            SignalEvent::CallAnswered(control) => self.on_call_answered(control).await,
            SignalEvent::CallRejected(control) => self.on_call_rejected(control).await,
            SignalEvent::CallEnded(control) => self.on_call_ended(control).await,
            SignalEvent::WebrtcOffer(payload) => self.on_offer(payload).await,
            SignalEvent::WebrtcAnswer(payload) => self.on_answer(payload).await,
            SignalEvent::WebrtcIce(payload) => self.on_ice(payload).await,
            other => debug!(target: "Call", "Ignoring {} on the call path", other.kind()),
        }
    }

    async fn on_incoming_call(&self, call: IncomingCall) {
        let mut slot = self.session.lock().await;
        if let Some(active) = slot.as_ref() {
            if active.call_id == call.call_id {
                debug!(target: "Call", "Duplicate incoming_call for {}", call.call_id);
                return;
            }
            info!(
                target: "Call",
                "Rejecting call {} from {}: busy with {}",
                call.call_id, call.caller_id, active.call_id
            );
            self.notify_peer(SignalEvent::RejectCall(CallControl {
                call_id: call.call_id.clone(),
                room_id: call.room_id.clone(),
                from: self.user_id.clone(),
                reason: Some(EndReason::Busy),
            }));
            self.emit(Event::MissedCall(MissedCall {
                call_id: call.call_id,
                caller_id: call.caller_id,
                call_type: call.call_type,
                reason: EndReason::Busy,
            }));
            return;
        }

        let mut session = CallSession::incoming(
            call.call_id.clone(),
            call.room_id.clone(),
            &call.caller_id,
            call.call_type,
        );
        self.arm_ring_timer(&mut session);
        info!(
            target: "Call",
            "Incoming {} call {} from {}",
            call.call_type, call.call_id, call.caller_id
        );
        self.emit(Event::IncomingCall(IncomingCallInfo {
            call_id: call.call_id,
            room_id: call.room_id,
            caller_id: call.caller_id,
            call_type: call.call_type,
        }));
        self.emit_status(&session);
        *slot = Some(session);
    }

    async fn on_call_answered(&self, control: CallControl) {
        let mut slot = self.session.lock().await;
        let Some(session) = session_for(&mut slot, &control.call_id, &control.room_id) else {
            debug!(target: "Call", "call_answered for unknown call {}", control.call_id);
            return;
        };
        if !session.is_caller() || session.status != CallStatus::Ringing {
            return;
        }
        self.remote_accepted(session);
    }

    async fn on_call_rejected(&self, control: CallControl) {
        let mut slot = self.session.lock().await;
        if session_for(&mut slot, &control.call_id, &control.room_id).is_none() {
            debug!(target: "Call", "call_rejected for unknown call {}", control.call_id);
            return;
        }
        let reason = control.reason.unwrap_or(EndReason::Declined);
        if let Some(call) = self
            .finish(&mut slot, CallTransition::Declined { reason }, None)
            .await
        {
            let call_id = call.call_id.clone();
            self.emit(Event::CallRejected(CallRejected { call, reason }));
            if reason == EndReason::Busy {
                self.emit(Event::CallBusy { call_id });
            }
        }
    }

    async fn on_call_ended(&self, control: CallControl) {
        let mut slot = self.session.lock().await;
        if session_for(&mut slot, &control.call_id, &control.room_id).is_none() {
            debug!(target: "Call", "call_ended for unknown call {}", control.call_id);
            return;
        }
        let reason = control.reason.unwrap_or(EndReason::Hangup);
        if let Some(call) = self
            .finish(&mut slot, CallTransition::Terminated { reason }, None)
            .await
        {
            self.emit(Event::CallEnded(CallEnded {
                call,
                reason,
                error: None,
            }));
        }
    }

    async fn on_offer(&self, payload: SdpPayload) {
        let mut slot = self.session.lock().await;
        let Some(session) = session_for(&mut slot, &payload.call_id, &payload.room_id) else {
            debug!(target: "Call/Negotiation", "Dropping offer for room {}", payload.room_id);
            return;
        };
        if session.is_caller() {
            debug!(target: "Call/Negotiation", "Ignoring offer received as caller");
            return;
        }
        let offer = payload.to_description(true);
        if session.peer().is_none() {
            if session.negotiation.buffer_offer(offer) {
                debug!(target: "Call/Negotiation", "Replaced buffered offer for call {}", session.call_id);
            } else {
                debug!(target: "Call/Negotiation", "Buffering offer for call {} until accept", session.call_id);
            }
            return;
        }
        if payload.ice_restart {
            debug!(target: "Call/Negotiation", "Answering ICE restart offer for call {}", session.call_id);
        }
        if let Err(error) = self.answer_offer(session, offer).await {
            self.fail(&mut slot, error).await;
        }
    }

    async fn on_answer(&self, payload: SdpPayload) {
        let mut slot = self.session.lock().await;
        let Some(session) = session_for(&mut slot, &payload.call_id, &payload.room_id) else {
            debug!(target: "Call/Negotiation", "Dropping answer for room {}", payload.room_id);
            return;
        };
        if !session.is_caller() || !session.negotiation.awaiting_answer() {
            debug!(target: "Call/Negotiation", "Ignoring unexpected answer for call {}", session.call_id);
            return;
        }
        if let Err(error) = self
            .apply_answer(session, payload.to_description(false))
            .await
        {
            self.fail(&mut slot, error).await;
        }
    }

    async fn on_ice(&self, payload: IcePayload) {
        let mut slot = self.session.lock().await;
        let Some(session) = session_for(&mut slot, &payload.call_id, &payload.room_id) else {
            debug!(target: "Call/Negotiation", "Dropping candidate for room {}", payload.room_id);
            return;
        };
        let candidate = payload.to_candidate();
        if candidate.is_end_of_candidates() {
            return;
        }
        match session.peer() {
            Some(peer) if session.negotiation.remote_description_set() => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!(target: "Call/Negotiation", "Dropping ICE candidate: {e}");
                }
            }
            _ => {
                session.negotiation.buffer_candidate(candidate);
                debug!(
                    target: "Call/Negotiation",
                    "Buffered candidate for call {} ({} pending)",
                    session.call_id,
                    session.negotiation.pending_candidate_count()
                );
            }
        }
    }

    // ==================== Peer connection events ====================

    pub(crate) async fn handle_peer_event(&self, call_id: &CallId, event: PeerEvent) {
        let mut slot = self.session.lock().await;
        let Some(session) = current(&mut slot, call_id) else {
            debug!(target: "Call/Negotiation", "Dropping peer event for stale call {call_id}");
            return;
        };
        let result = match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(room_id) = session.room_id.clone()
                    && !candidate.is_end_of_candidates()
                {
                    self.send_negotiation(SignalEvent::WebrtcIce(IcePayload {
                        call_id: call_id.clone(),
                        room_id,
                        from: self.user_id.clone(),
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                    }));
                }
                Ok(())
            }
            PeerEvent::RemoteTrack(track) => {
                debug!(target: "Call", "Remote {:?} track {} for call {call_id}", track.kind, track.id);
                self.media.render_remote(track).await;
                session.mark_rendering_remote();
                // Inbound media is the most reliable success signal.
                self.confirm_connected(session);
                Ok(())
            }
            PeerEvent::LinkStateChanged(state) => self.on_link_state(session, state).await,
        };
        if let Err(error) = result {
            self.fail(&mut slot, error).await;
        }
    }

    async fn on_link_state(
        &self,
        session: &mut CallSession,
        state: LinkState,
    ) -> Result<(), CallError> {
        debug!(target: "Call/Negotiation", "Link state for call {}: {:?}", session.call_id, state);
        let negotiating = matches!(
            session.status,
            CallStatus::Connecting | CallStatus::Connected
        );
        match state {
            LinkState::Connected => self.confirm_connected(session),
            LinkState::Checking => {
                if session.status == CallStatus::Connecting && !session.timers.connect.is_armed() {
                    self.arm_connect_timer(session);
                }
            }
            LinkState::Disconnected if negotiating => {
                if !session.timers.disconnect_grace.is_armed() {
                    let task = self.schedule(
                        &session.call_id,
                        TimerKind::DisconnectGrace,
                        self.config.disconnect_grace,
                    );
                    session.timers.disconnect_grace.arm(task);
                }
            }
            LinkState::Failed if negotiating => return self.restart_ice(session).await,
            _ => {}
        }
        Ok(())
    }

    // ==================== Transport lifecycle ====================

    pub async fn on_transport_disconnected(&self) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return;
        };
        session.reconnect_attempt += 1;
        if !session.status.is_connected() && !session.timers.transport_grace.is_armed() {
            warn!(
                target: "Call",
                "Transport lost while call {} is {:?}; waiting {:?} for it to return",
                session.call_id, session.status, self.config.transport_grace
            );
            let task = self.schedule(
                &session.call_id,
                TimerKind::TransportGrace,
                self.config.transport_grace,
            );
            session.timers.transport_grace.arm(task);
        }
        self.emit_status(session);
    }

    pub async fn on_transport_reconnected(&self) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return;
        };
        session.timers.transport_grace.cancel();
        if session.is_caller()
            && session.negotiation.awaiting_answer()
            && let Some(event) = self.offer_event(session, false)
        {
            debug!(target: "Call/Negotiation", "Re-sending offer for call {} after reconnect", session.call_id);
            self.send_negotiation(event);
        }
    }

    // ==================== Negotiation ====================

    async fn ensure_peer(
        &self,
        session: &mut CallSession,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        if let Some(peer) = session.peer() {
            return Ok(peer);
        }
        let local = session.local_media().cloned().ok_or_else(|| {
            CallError::Media(MediaError::Unavailable("local media not acquired".into()))
        })?;
        let sink = PeerEventSink::new(session.call_id.clone(), self.peer_events.clone());
        let peer = self
            .peers
            .create(&self.config.ice_servers, &local, sink)
            .await?;
        session.set_peer(peer.clone());
        Ok(peer)
    }

    fn offer_event(&self, session: &CallSession, ice_restart: bool) -> Option<SignalEvent> {
        let offer = session.negotiation.local_offer()?;
        Some(SignalEvent::WebrtcOffer(SdpPayload {
            call_id: session.call_id.clone(),
            room_id: session.room_id.clone()?,
            from: self.user_id.clone(),
            sdp: offer.sdp.clone(),
            ice_restart,
        }))
    }

    async fn send_offer(
        &self,
        session: &mut CallSession,
        ice_restart: bool,
    ) -> Result<(), CallError> {
        let peer = self.ensure_peer(session).await?;
        let offer = peer.create_offer(ice_restart).await?;
        offer.validate()?;
        peer.set_local_description(offer.clone()).await?;
        session.negotiation.record_local_offer(offer);

        let event = self
            .offer_event(session, ice_restart)
            .ok_or_else(|| CallError::Signaling("call has no signaling room".into()))?;
        debug!(
            target: "Call/Negotiation",
            "Sending {} offer for call {}",
            if ice_restart { "ICE restart" } else { "initial" },
            session.call_id
        );
        self.send_negotiation(event);

        if !ice_restart {
            let task = self.schedule(&session.call_id, TimerKind::Reoffer, self.config.reoffer_delay);
            session.timers.reoffer.arm(task);
        }
        Ok(())
    }

    async fn answer_offer(
        &self,
        session: &mut CallSession,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        offer.validate()?;
        let peer = self.ensure_peer(session).await?;
        peer.set_remote_description(offer).await?;
        session.negotiation.mark_remote_description_set();

        let answer = peer.create_answer().await?;
        answer.validate()?;
        peer.set_local_description(answer.clone()).await?;
        let room_id = session
            .room_id
            .clone()
            .ok_or_else(|| CallError::Signaling("call has no signaling room".into()))?;
        self.send_negotiation(SignalEvent::WebrtcAnswer(SdpPayload {
            call_id: session.call_id.clone(),
            room_id,
            from: self.user_id.clone(),
            sdp: answer.sdp,
            ice_restart: false,
        }));

        self.drain_pending_candidates(session, &peer).await;
        Ok(())
    }

    async fn apply_answer(
        &self,
        session: &mut CallSession,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        answer.validate()?;
        let peer = session
            .peer()
            .ok_or_else(|| NegotiationError::Peer("no peer connection".into()))?;
        peer.set_remote_description(answer).await?;
        session.negotiation.answer_applied();
        session.timers.reoffer.cancel();
        if session.status == CallStatus::Ringing {
            self.remote_accepted(session);
        }
        self.drain_pending_candidates(session, &peer).await;
        Ok(())
    }

    async fn drain_pending_candidates(
        &self,
        session: &mut CallSession,
        peer: &Arc<dyn PeerConnection>,
    ) {
        let pending = session.negotiation.take_pending_candidates();
        if pending.is_empty() {
            return;
        }
        debug!(
            target: "Call/Negotiation",
            "Applying {} buffered candidates for call {}",
            pending.len(),
            session.call_id
        );
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(target: "Call/Negotiation", "Dropping buffered ICE candidate: {e}");
            }
        }
    }

    async fn restart_ice(&self, session: &mut CallSession) -> Result<(), CallError> {
        let max = self.config.max_ice_restarts;
        let Some(attempt) = session.negotiation.next_restart_attempt(max) else {
            return Err(CallError::ConnectionFailed {
                attempts: session.negotiation.ice_restart_attempt(),
            });
        };
        warn!(
            target: "Call/Negotiation",
            "ICE restart {attempt}/{max} for call {}",
            session.call_id
        );
        session.timers.disconnect_grace.cancel();
        if session.status == CallStatus::Connected {
            session.apply(CallTransition::LinkLost)?;
            session.timers.quality.cancel();
            self.emit(Event::CallReconnecting(session.snapshot()));
        }

        let peer = session
            .peer()
            .ok_or_else(|| NegotiationError::Peer("no peer connection".into()))?;
        peer.restart_ice().await;
        if session.is_caller() {
            self.send_offer(session, true).await?;
        }
        self.arm_connect_timer(session);
        self.emit_status(session);
        Ok(())
    }

    fn remote_accepted(&self, session: &mut CallSession) {
        if let Err(e) = session.apply(CallTransition::RemoteAccepted) {
            debug!(target: "Call", "{e}");
            return;
        }
        session.timers.ring.cancel();
        self.arm_connect_timer(session);
        info!(target: "Call", "Call {} answered by {}", session.call_id, session.remote_user_id);
        self.emit_status(session);
    }

    fn confirm_connected(&self, session: &mut CallSession) {
        if session.status.is_connected() {
            return;
        }
        if session.status == CallStatus::Ringing && session.is_caller() {
            // Media beat the answer notification.
            self.remote_accepted(session);
        }
        if let Err(e) = session.apply(CallTransition::MediaConnected) {
            debug!(target: "Call", "Ignoring connection signal: {e}");
            return;
        }
        session.timers.cancel_connection_timers();
        session.negotiation.reset_restarts();
        session.connected_at.get_or_insert_with(Utc::now);
        let task = self.spawn_quality_monitor(&session.call_id);
        session.timers.quality.arm(task);

        info!(target: "Call", "Call {} connected", session.call_id);
        let snapshot = session.snapshot();
        self.emit(Event::CallConnected(snapshot.clone()));
        self.emit(Event::CallStatusChanged(snapshot));
    }

    // ==================== Quality monitor ====================

    fn spawn_quality_monitor(&self, call_id: &CallId) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        let call_id = call_id.clone();
        let period = self.config.quality_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if !manager.sample_quality(&call_id).await {
                    return;
                }
            }
        })
    }

    /// Take one stats sample. Returns false once the call left `connected`.
    async fn sample_quality(&self, call_id: &CallId) -> bool {
        let peer = {
            let mut slot = self.session.lock().await;
            match current(&mut slot, call_id) {
                Some(session) if session.status.is_connected() => session.peer(),
                _ => return false,
            }
        };
        let Some(peer) = peer else {
            return false;
        };
        let stats = match peer.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(target: "Call/Quality", "Stats sample failed for call {call_id}: {e}");
                return true;
            }
        };
        let quality = classify_stats(&stats);

        let mut slot = self.session.lock().await;
        let Some(session) = current(&mut slot, call_id) else {
            return false;
        };
        if !session.status.is_connected() {
            return false;
        }
        if session.quality != quality {
            debug!(
                target: "Call/Quality",
                "Call {call_id} quality {:?} -> {:?} (loss {:.3}, rtt {:.0}ms)",
                session.quality,
                quality,
                stats.loss_ratio(),
                stats.rtt_ms()
            );
            session.quality = quality;
            self.emit(Event::QualityChanged {
                call_id: call_id.clone(),
                quality,
            });
        }
        true
    }

    // ==================== Timers ====================

    fn schedule(&self, call_id: &CallId, kind: TimerKind, after: Duration) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(manager) = weak.upgrade() {
                // Detached so that cancelling this timer from inside the
                // handler cannot cut the handler short.
                tokio::spawn(async move { manager.on_timer(&call_id, kind).await });
            }
        })
    }

    fn arm_ring_timer(&self, session: &mut CallSession) {
        let task = self.schedule(&session.call_id, TimerKind::Ring, self.config.ring_timeout);
        session.timers.ring.arm(task);
    }

    fn arm_connect_timer(&self, session: &mut CallSession) {
        let attempt = session.negotiation.ice_restart_attempt();
        let task = self.schedule(
            &session.call_id,
            TimerKind::Connect { attempt },
            self.config.connect_timeout,
        );
        session.timers.connect.arm(task);
    }

    async fn on_timer(&self, call_id: &CallId, kind: TimerKind) {
        let mut slot = self.session.lock().await;
        let Some(session) = current(&mut slot, call_id) else {
            return;
        };
        let result = match kind {
            TimerKind::Ring => {
                if !session.status.is_ringing() {
                    return;
                }
                info!(target: "Call", "Call {call_id} was not answered in time");
                let reason = EndReason::NoAnswer;
                let control = self.control(session, Some(reason));
                if let Some(call) = self
                    .finish(&mut slot, CallTransition::Terminated { reason }, None)
                    .await
                {
                    if let Some(control) = control {
                        self.notify_peer(SignalEvent::EndCall(control));
                    }
                    self.emit(Event::CallTimeout {
                        call_id: call_id.clone(),
                    });
                    self.emit(Event::CallEnded(CallEnded {
                        call,
                        reason,
                        error: None,
                    }));
                }
                return;
            }
            TimerKind::Connect { attempt } => {
                if session.status != CallStatus::Connecting
                    || session.negotiation.ice_restart_attempt() != attempt
                {
                    return;
                }
                if session
                    .peer()
                    .is_some_and(|p| p.link_state() == LinkState::Connected)
                {
                    self.confirm_connected(session);
                    return;
                }
                debug!(
                    target: "Call/Negotiation",
                    "Call {call_id} not connected within {:?}",
                    self.config.connect_timeout
                );
                self.restart_ice(session).await
            }
            TimerKind::DisconnectGrace => {
                if !matches!(
                    session.status,
                    CallStatus::Connecting | CallStatus::Connected
                ) {
                    return;
                }
                match session.peer() {
                    Some(peer) if peer.link_state() == LinkState::Connected => {
                        debug!(target: "Call/Negotiation", "Link for call {call_id} recovered on its own");
                        Ok(())
                    }
                    _ => self.restart_ice(session).await,
                }
            }
            TimerKind::Reoffer => {
                if !session.is_caller() || session.negotiation.remote_description_set() {
                    return;
                }
                if let Some(event) = self.offer_event(session, false) {
                    debug!(target: "Call/Negotiation", "Re-sending unanswered offer for call {call_id}");
                    self.send_negotiation(event);
                }
                Ok(())
            }
            TimerKind::TransportGrace => {
                if session.status.is_connected() || self.transport.is_connected() {
                    return;
                }
                Err(CallError::TransportDisconnected)
            }
        };
        if let Err(error) = result {
            self.fail(&mut slot, error).await;
        }
    }

    // ==================== Teardown helpers ====================

    /// Move the session to a terminal state, release everything it owns and
    /// clear the slot. Returns the final snapshot, or `None` when there was
    /// nothing to finish.
    async fn finish(
        &self,
        slot: &mut Option<CallSession>,
        transition: CallTransition,
        error: Option<&CallError>,
    ) -> Option<CallSnapshot> {
        let mut session = slot.take()?;
        if let Err(e) = session.apply(transition) {
            warn!(target: "Call", "Finishing call {}: {e}", session.call_id);
        }
        if let Some(error) = error {
            session.error = Some(error.to_string());
        }
        session.release(self.media.as_ref()).await;
        info!(target: "Call", "Call {} finished: {:?}", session.call_id, session.status);
        let snapshot = session.snapshot();
        self.emit(Event::CallStatusChanged(snapshot.clone()));
        Some(snapshot)
    }

    /// End the call because of a fatal error and tell the peer.
    async fn fail(&self, slot: &mut Option<CallSession>, error: CallError) {
        let reason = error.end_reason();
        let control = slot.as_ref().and_then(|s| self.control(s, Some(reason)));
        warn!(target: "Call", "Ending call: {error}");
        if let Some(call) = self
            .finish(slot, CallTransition::Terminated { reason }, Some(&error))
            .await
        {
            if let Some(control) = control {
                self.notify_peer(SignalEvent::EndCall(control));
            }
            self.emit(Event::CallEnded(CallEnded {
                call,
                reason,
                error: Some(error.to_string()),
            }));
        }
    }

    async fn abort_pending(&self, call_id: &CallId, error: CallError) {
        let mut slot = self.session.lock().await;
        if current(&mut slot, call_id).is_some() {
            self.fail(&mut slot, error).await;
        }
    }

    async fn reset_accepting(&self, call_id: &CallId) {
        let mut slot = self.session.lock().await;
        if let Some(session) = current(&mut slot, call_id) {
            session.accepting = false;
        }
    }

    // ==================== Outbound signaling ====================

    fn control(&self, session: &CallSession, reason: Option<EndReason>) -> Option<CallControl> {
        Some(CallControl {
            call_id: session.call_id.clone(),
            room_id: session.room_id.clone()?,
            from: self.user_id.clone(),
            reason,
        })
    }

    /// Send call control, retrying a bounded number of times.
    async fn send_control(&self, event: SignalEvent) -> Result<Ack, CallError> {
        let kind = event.kind();
        let mut attempt = 0;
        loop {
            let error = match self.transport.send(event.clone()).await {
                Ok(ack) if ack.is_ok() => return Ok(ack),
                Ok(ack) => ack.error.unwrap_or_default(),
                Err(e) => e.to_string(),
            };
            if attempt >= self.config.signaling_retries {
                warn!(target: "Call", "Giving up on {kind} after {} attempts: {error}", attempt + 1);
                return Err(CallError::Signaling(format!("{kind}: {error}")));
            }
            attempt += 1;
            debug!(target: "Call", "Retrying {kind} ({error})");
            tokio::time::sleep(self.config.signaling_retry_delay).await;
        }
    }

    /// Notify the peer without holding up the caller.
    fn notify_peer(&self, event: SignalEvent) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = manager.send_control(event).await {
                warn!(target: "Call", "Peer notification failed: {e}");
            }
        });
    }

    fn send_negotiation(&self, event: SignalEvent) {
        if let Err(mpsc::error::SendError(event)) = self.outbound.send(event) {
            warn!(target: "Call/Negotiation", "Outbound queue closed, dropping {}", event.kind());
        }
    }

    fn emit(&self, event: Event) {
        self.event_bus.dispatch(&event);
    }

    fn emit_status(&self, session: &CallSession) {
        self.emit(Event::CallStatusChanged(session.snapshot()));
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidate_count(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.negotiation.pending_candidate_count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) async fn live_timers(&self) -> Vec<tokio::task::AbortHandle> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.timers.live_handles())
            .unwrap_or_default()
    }
}
