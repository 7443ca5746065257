//! One-to-one audio/video call sessions.
//!
//! A call is signaled over the shared transport and its media flows over a
//! peer connection negotiated with offer/answer and ICE candidates relayed
//! through a signaling room.
//!
//! # Architecture
//!
//! - [`CallStatus`] & [`CallTransition`]: the call state machine
//! - [`CallSnapshot`]: read-only view of the session handed to observers
//! - [`MediaDevices`], [`PeerConnection`], [`PeerConnectionFactory`]: seams to
//!   the platform's capture devices and WebRTC stack
//! - [`CallManager`]: owns the single session and orchestrates its lifecycle
//!
//! # Lifecycle
//!
//! The caller goes `calling -> ringing -> connecting -> connected`; the
//! receiver starts at `ringing`. Any live state can end as `ended` or
//! `rejected`, after which the manager releases every resource and returns to
//! idle. Only one call is live at a time; further incoming calls are answered
//! busy.

mod error;
mod manager;
mod negotiation;
mod peer;
mod quality;
mod session;
mod state;


pub use error::CallError;
pub use manager::CallManager;
pub use peer::{
    IceCandidate, IceServer, LinkState, LinkStats, LocalStream, MediaDevices, MediaError,
    NegotiationError, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    RemoteTrack, SdpKind, SessionDescription, TrackKind,
};
pub use quality::{classify, classify_stats};
pub use session::CallSnapshot;
pub use state::{CallStatus, CallTransition, InvalidTransition, next_status};
