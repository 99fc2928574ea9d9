//! Error types for the encrypted store.

use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure classes surfaced to callers of the store.
///
/// Every [`StorageError`] maps to exactly one kind, so bindings can switch on
/// the kind without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The caller supplied an invalid argument (e.g. an empty key).
    InvalidArgument,
    /// No active platform credential while one is required.
    LockedOut,
    /// The platform secure-credential subsystem is inaccessible.
    CredentialUnavailable,
    /// Ciphertext was tampered with, malformed or sealed under another key.
    AuthenticationFailed,
    /// Persistence I/O failed.
    StorageFailure,
    /// The device-state probe could not be queried.
    ProbeUnavailable,
}

/// Errors raised by the encrypted store and its components.
#[derive(Debug, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum StorageError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform reports no active credential and policy requires one.
    #[error("locked out: {0}")]
    LockedOut(String),

    /// The platform secure-credential subsystem could not be used.
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    /// Authenticated decryption failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A persistence operation failed.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// The device-state probe failed.
    #[error("probe unavailable: {0}")]
    ProbeUnavailable(String),
}

impl StorageError {
    /// Returns the failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::LockedOut(_) => ErrorKind::LockedOut,
            Self::CredentialUnavailable(_) => ErrorKind::CredentialUnavailable,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::StorageFailure(_) => ErrorKind::StorageFailure,
            Self::ProbeUnavailable(_) => ErrorKind::ProbeUnavailable,
        }
    }

    /// Returns the human-readable detail without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(message)
            | Self::LockedOut(message)
            | Self::CredentialUnavailable(message)
            | Self::AuthenticationFailed(message)
            | Self::StorageFailure(message)
            | Self::ProbeUnavailable(message) => message,
        }
    }

    /// Creates a storage failure from an I/O error with context.
    pub fn storage<S: Into<String>>(context: S, err: &std::io::Error) -> Self {
        Self::StorageFailure(format!("{}: {err}", context.into()))
    }

    /// Creates an authentication failure.
    pub fn authentication<S: Into<String>>(context: S) -> Self {
        Self::AuthenticationFailed(context.into())
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument<S: Into<String>>(reason: S) -> Self {
        Self::InvalidArgument(reason.into())
    }
}

#[cfg(feature = "ffi")]
impl From<uniffi::UnexpectedUniFFICallbackError> for StorageError {
    fn from(error: uniffi::UnexpectedUniFFICallbackError) -> Self {
        Self::CredentialUnavailable(format!("unexpected callback error: {}", error.reason))
    }
}

/// Errors reported by a platform secure-credential subsystem.
///
/// The vault and the probe translate these into [`StorageError`] kinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
pub enum PlatformError {
    /// The subsystem is inaccessible (hardware fault, service missing).
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    /// The subsystem refused because the device is locked or the user
    /// declined the credential prompt.
    #[error("platform locked: {0}")]
    LockedOut(String),

    /// The sealed blob was rejected (tampered, or sealed by another device).
    #[error("sealed blob rejected: {0}")]
    Rejected(String),
}

#[cfg(feature = "ffi")]
impl From<uniffi::UnexpectedUniFFICallbackError> for PlatformError {
    fn from(error: uniffi::UnexpectedUniFFICallbackError) -> Self {
        Self::Unavailable(error.reason)
    }
}
