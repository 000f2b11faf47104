//! Error types for the Consent Kernel Core.

use thiserror::Error;

/// Core errors raised while building or parsing identifiers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid key id: {0}")]
    InvalidKeyId(String),

    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::EncodingError(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
