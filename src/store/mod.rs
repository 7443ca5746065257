//! Durable storage for messages that have not been confirmed by the server.

pub mod error;
pub mod filestore;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use filestore::FileStore;
pub use memory::MemoryStore;
pub use traits::QueueStore;
