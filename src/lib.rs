//! Real-time session layer for one-to-one chat and audio/video calls.
//!
//! - [`calls`]: call state machine, offer/answer negotiation and link quality
//! - [`messaging`]: optimistic message delivery with an offline queue
//! - [`client`]: wires both to a [`transport::Transport`]
//! - `loopback` (feature `loopback`, on by default): in-process signaling
//!   server and simulated media stack

pub mod calls;
pub mod client;
pub mod config;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
pub mod messaging;
pub mod protocol;
pub mod store;
pub mod transport;

mod timers;

pub mod types {
    pub mod call;
    pub mod events;
    pub mod message;
}

#[cfg(test)]
mod test_utils;

pub use client::{Client, ClientBuilder, ClientError};
pub use config::ClientConfig;
