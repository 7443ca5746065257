//! Signaling and chat events exchanged with the transport client.
//!
//! Events travel as `{"type": "<event name>", "payload": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calls::{IceCandidate, SessionDescription};
use crate::types::call::{CallId, CallType, EndReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalEvent {
    InitiateCall(InitiateCall),
    IncomingCall(IncomingCall),
    AnswerCall(CallControl),
    CallAnswered(CallControl),
    RejectCall(CallControl),
    CallRejected(CallControl),
    EndCall(CallControl),
    CallEnded(CallControl),
    WebrtcOffer(SdpPayload),
    WebrtcAnswer(SdpPayload),
    WebrtcIce(IcePayload),
    SendMessage(OutgoingMessage),
    Message(ChatMessage),
    Typing(Typing),
    MarkRead(MarkRead),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateCall {
    pub call_id: CallId,
    pub caller_id: String,
    pub target_id: String,
    pub call_type: CallType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub room_id: String,
    pub caller_id: String,
    pub call_type: CallType,
}

/// Answer, reject and end share one payload in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallControl {
    pub call_id: CallId,
    pub room_id: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub call_id: CallId,
    pub room_id: String,
    pub from: String,
    pub sdp: String,
    #[serde(default)]
    pub ice_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcePayload {
    pub call_id: CallId,
    pub room_id: String,
    pub from: String,
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

impl IcePayload {
    pub fn to_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub local_id: String,
    pub room_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    pub room_id: String,
    pub user_id: String,
    pub receiver_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRead {
    pub room_id: String,
    pub reader_id: String,
    pub receiver_id: String,
    pub message_ids: Vec<String>,
}

impl SignalEvent {
    /// The wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitiateCall(_) => "initiate_call",
            Self::IncomingCall(_) => "incoming_call",
            Self::AnswerCall(_) => "answer_call",
            Self::CallAnswered(_) => "call_answered",
            Self::RejectCall(_) => "reject_call",
            Self::CallRejected(_) => "call_rejected",
            Self::EndCall(_) => "end_call",
            Self::CallEnded(_) => "call_ended",
            Self::WebrtcOffer(_) => "webrtc_offer",
            Self::WebrtcAnswer(_) => "webrtc_answer",
            Self::WebrtcIce(_) => "webrtc_ice",
            Self::SendMessage(_) => "send_message",
            Self::Message(_) => "message",
            Self::Typing(_) => "typing",
            Self::MarkRead(_) => "mark_read",
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::InitiateCall(_) => None,
            Self::IncomingCall(e) => Some(&e.room_id),
            Self::AnswerCall(e)
            | Self::CallAnswered(e)
            | Self::RejectCall(e)
            | Self::CallRejected(e)
            | Self::EndCall(e)
            | Self::CallEnded(e) => Some(&e.room_id),
            Self::WebrtcOffer(e) | Self::WebrtcAnswer(e) => Some(&e.room_id),
            Self::WebrtcIce(e) => Some(&e.room_id),
            Self::SendMessage(e) => Some(&e.room_id),
            Self::Message(e) => Some(&e.room_id),
            Self::Typing(e) => Some(&e.room_id),
            Self::MarkRead(e) => Some(&e.room_id),
        }
    }

    /// The user who produced the event.
    pub fn sender(&self) -> &str {
        match self {
            Self::InitiateCall(e) => &e.caller_id,
            Self::IncomingCall(e) => &e.caller_id,
            Self::AnswerCall(e)
            | Self::CallAnswered(e)
            | Self::RejectCall(e)
            | Self::CallRejected(e)
            | Self::EndCall(e)
            | Self::CallEnded(e) => &e.from,
            Self::WebrtcOffer(e) | Self::WebrtcAnswer(e) => &e.from,
            Self::WebrtcIce(e) => &e.from,
            Self::SendMessage(e) => &e.sender_id,
            Self::Message(e) => &e.sender_id,
            Self::Typing(e) => &e.user_id,
            Self::MarkRead(e) => &e.reader_id,
        }
    }

    pub fn is_call_event(&self) -> bool {
        !matches!(
            self,
            Self::SendMessage(_) | Self::Message(_) | Self::Typing(_) | Self::MarkRead(_)
        )
    }
}

impl SdpPayload {
    pub fn to_description(&self, offer: bool) -> SessionDescription {
        if offer {
            SessionDescription::offer(self.sdp.clone())
        } else {
            SessionDescription::answer(self.sdp.clone())
        }
    }
}

/// Server acknowledgement of a sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Signaling room granted for `initiate_call`.
    #[serde(default)]
    pub room_id: Option<String>,
    /// Server id assigned to a `send_message`.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.into()),
            ..Self::default()
        }
    }

    pub fn message(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Self::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
