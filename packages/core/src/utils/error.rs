// Типы ошибок

use crate::error::CryptoError;
use crate::protocol::envelope::EnvelopeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Identity could not be read or created. Blocks send and receive.
    #[error("Key initialization failed: {0}")]
    KeyInitializationFailed(String),

    /// Recipient bundle missing, unfetchable or failing signature checks.
    #[error("Peer key unavailable: {0}")]
    PeerKeyUnavailable(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Queue capacity exceeded: {0}")]
    QueueCapacityExceeded(String),

    #[error("Cryptography error: {0}")]
    CryptoError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Envelope error: {0}")]
    EnvelopeError(#[from] EnvelopeError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        CoreError::CryptoError(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
