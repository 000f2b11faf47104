//! Error types for the permissions module.

use thiserror::Error;

use consent_kernel_core::KeyId;

/// Errors that can occur during key and graph operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Decryption error. On a stored edge this means corruption.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Key derivation error.
    #[error("key derivation error: {0}")]
    KeyDerivationError(String),

    /// Key bytes or type are unusable for the requested operation.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A path referenced an edge that is not stored.
    #[error("missing edge {src} -> {dst}")]
    MissingEdge { src: KeyId, dst: KeyId },

    /// Path does not start at the key used to walk it.
    #[error("path root mismatch: expected {expected}, got {got}")]
    PathRootMismatch { expected: KeyId, got: KeyId },

    /// Breadth-first search visited more nodes than allowed.
    #[error("key graph search exceeded {0} nodes")]
    SearchLimit(usize),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Error surfaced by the edge store.
    #[error("storage error: {0}")]
    Storage(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] consent_kernel_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
