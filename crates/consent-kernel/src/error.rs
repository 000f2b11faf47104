//! Error types for the Kernel.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use consent_kernel_core::CoreError;
use consent_kernel_perms::PermsError;
use consent_kernel_store::StoreError;

/// Error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NoAccess,
    NotFound,
    BadState,
    BadInput,
    Expired,
    OffchainUnavailable,
    InvariantViolation,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoAccess => "no-access",
            ErrorCode::NotFound => "not-found",
            ErrorCode::BadState => "bad-state",
            ErrorCode::BadInput => "bad-input",
            ErrorCode::Expired => "expired",
            ErrorCode::OffchainUnavailable => "offchain-unavailable",
            ErrorCode::InvariantViolation => "invariant-violation",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during Kernel operations.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Identifier or encoding error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Key or key graph error.
    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// Malformed JSON argument.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller cannot reach the required key or lacks the role.
    #[error("no access: {0}")]
    NoAccess(String),

    /// Asset or principal not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// State machine violation or duplicate.
    #[error("bad state: {0}")]
    BadState(String),

    /// Invalid argument.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Timestamp outside its window.
    #[error("expired: {0}")]
    Expired(String),

    /// The off-chain store behind a connection is unreachable.
    #[error("off-chain store unavailable: {0}")]
    OffchainUnavailable(String),

    /// Stored state is corrupt or inconsistent.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
}

impl KernelError {
    /// The caller-facing code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::Core(_) => ErrorCode::BadInput,
            KernelError::Store(e) => match e {
                StoreError::NotFound(_) => ErrorCode::NotFound,
                StoreError::BlobUnavailable(_) => ErrorCode::OffchainUnavailable,
                StoreError::Aborted(_) => ErrorCode::BadState,
                _ => ErrorCode::InvariantViolation,
            },
            KernelError::Permission(e) => match e {
                PermsError::InvalidKey(_) => ErrorCode::BadInput,
                PermsError::CoreError(_) => ErrorCode::BadInput,
                _ => ErrorCode::InvariantViolation,
            },
            KernelError::Json(_) => ErrorCode::BadInput,
            KernelError::NoAccess(_) => ErrorCode::NoAccess,
            KernelError::NotFound(_) => ErrorCode::NotFound,
            KernelError::BadState(_) => ErrorCode::BadState,
            KernelError::BadInput(_) => ErrorCode::BadInput,
            KernelError::Expired(_) => ErrorCode::Expired,
            KernelError::OffchainUnavailable(_) => ErrorCode::OffchainUnavailable,
            KernelError::Invariant(_) => ErrorCode::InvariantViolation,
            KernelError::Config(_) => ErrorCode::BadInput,
        }
    }

    /// Wrap a failure to decode a stored record.
    pub(crate) fn corrupt(what: impl fmt::Display, e: impl fmt::Display) -> Self {
        KernelError::Invariant(format!("corrupt {what}: {e}"))
    }
}

/// Result type for Kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;
