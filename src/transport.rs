//! The persistent bidirectional connection the session layer rides on.
//!
//! The transport client itself lives outside this crate. It is handed to
//! [`crate::client::Client`] as a [`Transport`] for outbound events plus a
//! receiver of [`TransportEvent`]s for inbound traffic and lifecycle changes.

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Ack, SignalEvent};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,

    #[error("server rejected event: {0}")]
    Rejected(String),

    #[error("timed out waiting for acknowledgement")]
    Timeout,

    #[error("transport i/o error: {0}")]
    Io(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an event and wait for the server acknowledgement.
    async fn send(&self, event: SignalEvent) -> Result<Ack, TransportError>;

    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Authenticated,
    Disconnected,
    Reconnecting { attempt: u32 },
    Reconnected,
    Received(SignalEvent),
}
