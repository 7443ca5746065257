//! Call-related error types.

use thiserror::Error;

use super::peer::{MediaError, NegotiationError};
use crate::types::call::EndReason;

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("media unavailable: {0}")]
    Media(#[from] MediaError),

    #[error("signaling failed: {0}")]
    Signaling(String),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("connection failed after {attempts} ICE restart attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("another call is in progress")]
    Busy,

    #[error("no active call")]
    NoActiveCall,

    #[error("call was cancelled")]
    Cancelled,
}

impl CallError {
    /// Reason recorded on the session when this error ends a call.
    pub fn end_reason(&self) -> EndReason {
        match self {
            Self::Media(_) => EndReason::MediaError,
            Self::Signaling(_) => EndReason::SignalingFailed,
            Self::Negotiation(_) => EndReason::NegotiationFailed,
            Self::ConnectionFailed { .. } | Self::TransportDisconnected => {
                EndReason::ConnectionFailed
            }
            _ => EndReason::Hangup,
        }
    }
}
