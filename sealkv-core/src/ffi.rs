//! Foreign bindings (Swift, Kotlin, React Native) through UniFFI.

use std::sync::Arc;

use crate::error::{PlatformError, StorageError};
use crate::platform::CredentialSubsystem;
use crate::{EncryptedStorage, StoreConfig};

/// Platform secure-credential subsystem implemented by the host app.
///
/// iOS hosts back this with Keychain Services and `LAContext`; Android hosts
/// with the Android Keystore and `KeyguardManager`.
#[uniffi::export(with_foreign)]
pub trait ForeignCredentialSubsystem: Send + Sync {
    /// Seals `plaintext` under the device-bound key.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses or is unavailable.
    fn seal(&self, associated_data: Vec<u8>, plaintext: Vec<u8>)
        -> Result<Vec<u8>, PlatformError>;

    /// Opens a blob produced by `seal`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is locked, the blob is rejected or the
    /// platform is unavailable.
    fn unseal(&self, associated_data: Vec<u8>, sealed: Vec<u8>)
        -> Result<Vec<u8>, PlatformError>;

    /// Reports whether a lock-screen or biometric credential is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot be queried.
    fn has_active_credential(&self) -> Result<bool, PlatformError>;
}

struct ForeignCredentialAdapter {
    inner: Arc<dyn ForeignCredentialSubsystem>,
}

impl CredentialSubsystem for ForeignCredentialAdapter {
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, PlatformError> {
        self.inner.seal(associated_data.to_vec(), plaintext.to_vec())
    }

    fn unseal(&self, associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>, PlatformError> {
        self.inner.unseal(associated_data.to_vec(), sealed.to_vec())
    }

    fn has_active_credential(&self) -> Result<bool, PlatformError> {
        self.inner.has_active_credential()
    }
}

/// Encrypted key-value store exported to foreign languages.
#[derive(uniffi::Object)]
pub struct SecureStore {
    inner: EncryptedStorage,
}

#[uniffi::export(async_runtime = "tokio")]
impl SecureStore {
    /// Opens a store from a JSON [`StoreConfig`].
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a malformed configuration, `StorageFailure` if
    /// the store directory cannot be prepared.
    #[uniffi::constructor]
    pub fn new(
        config_json: &str,
        credential: Arc<dyn ForeignCredentialSubsystem>,
    ) -> Result<Self, StorageError> {
        let config = StoreConfig::from_json(config_json)?;
        let credential = Arc::new(ForeignCredentialAdapter { inner: credential });
        Ok(Self {
            inner: EncryptedStorage::open(config, credential)?,
        })
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::set_item`].
    pub async fn set_item(&self, key: String, value: String) -> Result<(), StorageError> {
        self.inner.set_item(&key, &value).await
    }

    /// Returns the value under `key`, or `None`.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::get_item`].
    pub async fn get_item(&self, key: String) -> Result<Option<String>, StorageError> {
        self.inner.get_item(&key).await
    }

    /// Removes the value under `key`.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::remove_item`].
    pub async fn remove_item(&self, key: String) -> Result<(), StorageError> {
        self.inner.remove_item(&key).await
    }

    /// Returns `true` if a value is stored under `key`.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::contains_item`].
    pub async fn contains_item(&self, key: String) -> Result<bool, StorageError> {
        self.inner.contains_item(&key).await
    }

    /// Removes every value.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::clear`].
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }

    /// Reports whether the device has an active credential.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::is_device_protected`].
    pub async fn is_device_protected(&self) -> Result<bool, StorageError> {
        self.inner.is_device_protected().await
    }

    /// Replaces the master key.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::rotate_master_key`].
    pub async fn rotate_master_key(&self) -> Result<(), StorageError> {
        self.inner.rotate_master_key().await
    }

    /// Creates the master key eagerly.
    ///
    /// # Errors
    ///
    /// See [`EncryptedStorage::initialize`].
    pub async fn initialize(&self) -> Result<(), StorageError> {
        self.inner.initialize().await
    }

    /// Drops any cached unsealed master key.
    pub fn lock(&self) {
        self.inner.lock();
    }
}
