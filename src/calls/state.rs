//! Call state machine implementation.

use serde::Serialize;

use crate::types::call::{CallRole, EndReason};

/// Current status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallStatus {
    /// No call.
    #[default]
    Idle,
    /// Outgoing call: acquiring media and waiting for a signaling room.
    Calling,
    /// Outgoing call waiting for an answer, or incoming call ringing locally.
    Ringing,
    /// Accepted, peer negotiation in progress.
    Connecting,
    /// Media flowing.
    Connected,
    Ended { reason: EndReason },
    Rejected { reason: EndReason },
}

impl CallStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Rejected { .. })
    }

    /// A session exists and has not finished.
    pub fn is_live(&self) -> bool {
        !self.is_idle() && !self.is_terminal()
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy)]
pub enum CallTransition {
    /// The transport granted a signaling room for an outgoing call.
    RoomAllocated,
    LocalAccepted,
    RemoteAccepted,
    MediaConnected,
    /// The link dropped and an ICE restart is in progress.
    LinkLost,
    Declined { reason: EndReason },
    Terminated { reason: EndReason },
}

/// Compute the status that follows `transition`.
pub fn next_status(
    current: CallStatus,
    role: CallRole,
    transition: CallTransition,
) -> Result<CallStatus, InvalidTransition> {
    use CallStatus as S;
    use CallTransition as T;

    let next = match (current, transition) {
        (S::Calling, T::RoomAllocated) if role == CallRole::Caller => S::Ringing,
        (S::Ringing, T::LocalAccepted) if role == CallRole::Receiver => S::Connecting,
        (S::Ringing, T::RemoteAccepted) if role == CallRole::Caller => S::Connecting,
        (S::Connecting, T::MediaConnected) => S::Connected,
        (S::Connected, T::LinkLost) => S::Connecting,
        (current, T::Declined { reason }) if current.is_live() => S::Rejected { reason },
        (current, T::Terminated { reason }) if current.is_live() => S::Ended { reason },
        (current, transition) => {
            return Err(InvalidTransition {
                current_state: format!("{:?}", current),
                attempted: format!("{:?}", transition),
            });
        }
    };
    Ok(next)
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(status: CallStatus, role: CallRole, t: CallTransition) -> CallStatus {
        next_status(status, role, t).unwrap()
    }

    /// Flow: Calling → Ringing → Connecting → Connected → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let role = CallRole::Caller;
        let mut status = CallStatus::Calling;

        status = step(status, role, CallTransition::RoomAllocated);
        assert!(status.is_ringing());

        status = step(status, role, CallTransition::RemoteAccepted);
        assert_eq!(status, CallStatus::Connecting);

        status = step(status, role, CallTransition::MediaConnected);
        assert!(status.is_connected());

        status = step(
            status,
            role,
            CallTransition::Terminated {
                reason: EndReason::Hangup,
            },
        );
        assert!(status.is_terminal());
        assert_eq!(
            status,
            CallStatus::Ended {
                reason: EndReason::Hangup
            }
        );
    }

    /// Flow: Ringing → Connecting → Connected → Connecting (ICE restart) → Connected
    #[test]
    fn test_incoming_call_flow_with_link_loss() {
        let role = CallRole::Receiver;
        let mut status = CallStatus::Ringing;

        status = step(status, role, CallTransition::LocalAccepted);
        status = step(status, role, CallTransition::MediaConnected);
        status = step(status, role, CallTransition::LinkLost);
        assert_eq!(status, CallStatus::Connecting);
        status = step(status, role, CallTransition::MediaConnected);
        assert!(status.is_connected());
    }

    #[test]
    fn test_role_guards() {
        // A caller cannot accept locally and a receiver never sees a remote accept.
        assert!(
            next_status(
                CallStatus::Ringing,
                CallRole::Caller,
                CallTransition::LocalAccepted
            )
            .is_err()
        );
        assert!(
            next_status(
                CallStatus::Ringing,
                CallRole::Receiver,
                CallTransition::RemoteAccepted
            )
            .is_err()
        );
        assert!(
            next_status(
                CallStatus::Calling,
                CallRole::Receiver,
                CallTransition::RoomAllocated
            )
            .is_err()
        );
    }

    #[test]
    fn test_decline_from_any_live_state() {
        for status in [
            CallStatus::Calling,
            CallStatus::Ringing,
            CallStatus::Connecting,
            CallStatus::Connected,
        ] {
            let next = step(
                status,
                CallRole::Receiver,
                CallTransition::Declined {
                    reason: EndReason::Declined,
                },
            );
            assert_eq!(
                next,
                CallStatus::Rejected {
                    reason: EndReason::Declined
                }
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let ended = CallStatus::Ended {
            reason: EndReason::NoAnswer,
        };
        for t in [
            CallTransition::MediaConnected,
            CallTransition::RemoteAccepted,
            CallTransition::Terminated {
                reason: EndReason::Hangup,
            },
            CallTransition::Declined {
                reason: EndReason::Declined,
            },
        ] {
            assert!(next_status(ended, CallRole::Caller, t).is_err());
        }
        assert!(
            next_status(
                CallStatus::Idle,
                CallRole::Caller,
                CallTransition::Terminated {
                    reason: EndReason::Hangup
                }
            )
            .is_err()
        );
    }

    #[test]
    fn test_cannot_connect_before_accept() {
        assert!(
            next_status(
                CallStatus::Ringing,
                CallRole::Caller,
                CallTransition::MediaConnected
            )
            .is_err()
        );
    }
}
