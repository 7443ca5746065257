//! Chat message delivery.
//!
//! Outgoing messages are listed optimistically as `sending`, confirmed with
//! the server-assigned id once acknowledged and kept in a persistent queue
//! while the transport is down. A queued message is retried on every flush
//! until it is delivered or reaches the retry bound, after which it is
//! `failed` and can only be retried or deleted by hand.

mod error;
mod list;
mod queue;
mod typing;

pub use error::DeliveryError;
pub use list::MessageList;
pub use queue::{DeliveryQueue, FlushReport};
pub use typing::TypingIndicator;
