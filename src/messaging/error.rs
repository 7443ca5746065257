use thiserror::Error;

use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("message text is empty")]
    EmptyMessage,

    #[error("message {0} not found")]
    NotFound(String),

    #[error("message {0} is not in a failed state")]
    NotFailed(String),

    #[error("delivery failed after {attempts} attempts")]
    Failed { attempts: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
