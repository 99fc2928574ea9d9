//! Platform abstraction for the secure-credential subsystem.
//!
//! The store never talks to a concrete keychain. Each target provides one
//! [`CredentialSubsystem`] and injects it at construction time:
//!
//! - iOS: Keychain Services with `kSecAttrAccessibleWhenUnlockedThisDeviceOnly`,
//!   `LAContext.canEvaluatePolicy` for the credential probe
//! - Android: Android Keystore (AES-256-GCM), `KeyguardManager.isDeviceSecure`
//! - Desktop/development: [`FileCredentialSubsystem`]
//! - Tests: [`MemoryCredentialSubsystem`]

mod file;
pub mod memory;

pub use file::FileCredentialSubsystem;
pub use memory::MemoryCredentialSubsystem;

use crate::error::PlatformError;

/// Device-bound sealing and lock-state queries.
///
/// # Security Requirements
///
/// - The sealing key MUST be non-exportable when the platform supports it and
///   bound to the device (not restorable from backup).
/// - `seal` MUST use authenticated encryption over `associated_data`; `unseal`
///   with different associated data MUST fail.
pub trait CredentialSubsystem: Send + Sync {
    /// Seals `plaintext` under the device-bound key, authenticating
    /// `associated_data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subsystem refuses or is unavailable.
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, PlatformError>;

    /// Recovers a blob sealed by [`seal`](Self::seal).
    ///
    /// May block while the platform shows a credential prompt.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::LockedOut`] when the device is locked or the
    /// prompt was declined, [`PlatformError::Rejected`] when authentication of
    /// the blob fails, and [`PlatformError::Unavailable`] otherwise.
    fn unseal(&self, associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>, PlatformError>;

    /// Reports whether a lock-screen or biometric credential is currently set.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot be queried.
    fn has_active_credential(&self) -> Result<bool, PlatformError>;
}
