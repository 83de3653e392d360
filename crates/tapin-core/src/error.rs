//! Unified error types for the tapin core library.
//!
//! [`TapinError`] covers every failure mode a reader can run into. Modules
//! keep their own specific error types ([`ConfigError`], [`StorageError`],
//! [`BackendError`]) and convert into this one at task boundaries.
//!
//! The network task makes its recovery decisions on this type:
//!
//! - **transport** errors are retried with backoff, then buffered
//! - a rejected credential triggers re-registration
//! - **storage** errors are counted and degrade to in-memory holding
//! - a stalled task is never an error value; the watchdog restarts the device
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`StorageError`]: crate::storage::StorageError
//! [`BackendError`]: crate::backend::BackendError

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all tapin operations.
#[derive(Debug, Error)]
pub enum TapinError {
    // =========================================================================
    // BACKEND ERRORS
    // =========================================================================
    /// The request never produced an HTTP response (DNS, connect, timeout).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend rejected the bearer credential (HTTP 401).
    #[error("Credential rejected by backend; re-registration required")]
    CredentialRejected,

    /// The backend refused the provisioning secret (HTTP 403).
    #[error("Provisioning secret rejected. Check device.provisioning_secret.")]
    SecretMismatch,

    /// The backend answered with a status the contract does not define.
    #[error("Unexpected backend status {0}")]
    UnexpectedStatus(u16),

    /// The backend response body could not be decoded.
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    // =========================================================================
    // LINK ERRORS
    // =========================================================================
    /// Every known network profile was tried without success.
    #[error("No network profile could be joined ({attempts} attempts)")]
    LinkUnavailable {
        /// Total connection attempts made.
        attempts: u32,
    },

    // =========================================================================
    // PERIPHERAL & CONCURRENCY ERRORS
    // =========================================================================
    /// The card reader failed to complete a poll.
    #[error("Card reader fault: {0}")]
    ReaderFault(String),

    /// A peripheral lock could not be acquired within its timeout.
    #[error("Timed out acquiring the {0} lock")]
    LockTimeout(&'static str),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// The event buffer or identity record could not be read or written.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A persisted entry failed validation.
    #[error("Corrupt entry {}: {reason}", .path.display())]
    CorruptEntry {
        /// File holding the entry.
        path: PathBuf,
        /// What failed to validate.
        reason: String,
    },
}

/// A specialized [`Result`] type for tapin operations.
pub type Result<T> = std::result::Result<T, TapinError>;

impl TapinError {
    /// Returns `true` for failures retried with backoff before buffering.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::UnexpectedStatus(_) | Self::MalformedResponse(_)
        )
    }

    /// Returns `true` for persistent storage failures. A lock timeout is
    /// contention, not a storage failure.
    #[inline]
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::CorruptEntry { .. })
    }

    /// Returns a machine-readable error code for logs and diagnostics.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT",
            Self::CredentialRejected => "CREDENTIAL_REJECTED",
            Self::SecretMismatch => "SECRET_MISMATCH",
            Self::UnexpectedStatus(_) => "UNEXPECTED_STATUS",
            Self::MalformedResponse(_) => "MALFORMED_RESPONSE",
            Self::LinkUnavailable { .. } => "LINK_UNAVAILABLE",
            Self::ReaderFault(_) => "READER_FAULT",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::CorruptEntry { .. } => "CORRUPT_ENTRY",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for TapinError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {source}", path.display()))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {source}", path.display()))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::storage::StorageError> for TapinError {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;
        match err {
            StorageError::Io { path, source } => {
                Self::PersistenceError(format!("{}: {source}", path.display()))
            }
            StorageError::Corrupt { path, reason } => Self::CorruptEntry { path, reason },
            StorageError::Encode(e) => Self::PersistenceError(e.to_string()),
        }
    }
}

impl From<crate::backend::BackendError> for TapinError {
    fn from(err: crate::backend::BackendError) -> Self {
        use crate::backend::BackendError;
        match err {
            BackendError::Transport(message) => Self::Transport(message),
            BackendError::Unauthorized => Self::CredentialRejected,
            BackendError::Forbidden => Self::SecretMismatch,
            BackendError::Status(code) => Self::UnexpectedStatus(code),
            BackendError::Decode(message) => Self::MalformedResponse(message),
            BackendError::InvalidUrl(message) => Self::ConfigValidationError(message),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
