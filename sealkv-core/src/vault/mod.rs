//! Master key management.
//!
//! The master key is generated once per store, sealed by the platform
//! credential subsystem and kept in the persistence layer's metadata slot as a
//! [`envelope::MasterKeyEnvelope`]. The vault unseals it on demand and only
//! hands it to the cipher engine.

mod envelope;

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox};
use zeroize::Zeroizing;

use envelope::MasterKeyEnvelope;

use crate::cipher::CipherEngine;
use crate::config::CredentialPolicy;
use crate::error::{PlatformError, StorageError, StorageResult};
use crate::persistence::{PersistenceLayer, Record};
use crate::platform::CredentialSubsystem;

pub(crate) const MASTER_KEY_AD: &[u8] = b"sealkv:master-key";

/// Size of the master key in bytes.
pub const MASTER_KEY_SIZE: usize = 32;

/// An unsealed 256-bit master key.
///
/// The key lives in a zeroize-on-drop box and is never printed.
pub struct MasterKey {
    key: SecretBox<[u8; MASTER_KEY_SIZE]>,
}

impl MasterKey {
    /// Generates a fresh random key.
    pub(crate) fn generate() -> Self {
        Self {
            key: SecretBox::init_with(|| {
                let mut key = [0u8; MASTER_KEY_SIZE];
                OsRng.fill_bytes(&mut key);
                key
            }),
        }
    }

    fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let key: [u8; MASTER_KEY_SIZE] = bytes.try_into().map_err(|_| {
            StorageError::CredentialUnavailable(format!(
                "unsealed master key has length {} (expected {MASTER_KEY_SIZE})",
                bytes.len()
            ))
        })?;
        Ok(Self {
            key: SecretBox::init_with(|| key),
        })
    }

    pub(crate) fn expose(&self) -> &[u8; MASTER_KEY_SIZE] {
        self.key.expose_secret()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Unsealed key kept between operations when caching is enabled.
struct CachedKey {
    key: Arc<MasterKey>,
}

/// Guards access to the master key.
pub struct KeyVault {
    credential: Arc<dyn CredentialSubsystem>,
    persistence: Arc<PersistenceLayer>,
    policy: CredentialPolicy,
    cache_unsealed_key: bool,
    cached: Mutex<Option<CachedKey>>,
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("policy", &self.policy)
            .field("cache_unsealed_key", &self.cache_unsealed_key)
            .finish_non_exhaustive()
    }
}

impl KeyVault {
    /// Creates a vault over `persistence`, sealing with `credential`.
    #[must_use]
    pub fn new(
        credential: Arc<dyn CredentialSubsystem>,
        persistence: Arc<PersistenceLayer>,
        policy: CredentialPolicy,
        cache_unsealed_key: bool,
    ) -> Self {
        Self {
            credential,
            persistence,
            policy,
            cache_unsealed_key,
            cached: Mutex::new(None),
        }
    }

    /// Unseals the existing master key.
    ///
    /// # Errors
    ///
    /// - `LockedOut` if policy requires an active credential and there is
    ///   none, or the platform refuses because the device is locked.
    /// - `CredentialUnavailable` if no key was created yet, or the platform
    ///   subsystem is inaccessible or rejects the sealed key.
    pub fn unseal(&self) -> StorageResult<Arc<MasterKey>> {
        let metadata = self.persistence.read_metadata()?;
        self.unseal_metadata(metadata.as_deref())
    }

    /// Unseals the master key held in `metadata`, a metadata slot read
    /// together with the records it protects
    /// (see [`PersistenceLayer::read_with_metadata`]).
    ///
    /// # Errors
    ///
    /// Same as [`KeyVault::unseal`].
    pub fn unseal_metadata(&self, metadata: Option<&[u8]>) -> StorageResult<Arc<MasterKey>> {
        self.enforce_policy()?;
        let bytes = metadata.ok_or_else(|| {
            StorageError::CredentialUnavailable("no master key has been created".to_string())
        })?;
        self.open_envelope(&MasterKeyEnvelope::deserialize(bytes)?)
    }

    /// Writes `record`, sealed under `key`, unless the store's master key has
    /// changed since `key` was unsealed. Returns `false` when nothing was
    /// written and the caller must seal again under the current key.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the record cannot be written.
    pub fn write_record(&self, key: &MasterKey, record: &Record) -> StorageResult<bool> {
        self.persistence.write_if_metadata(record, |metadata| {
            metadata
                .and_then(|bytes| MasterKeyEnvelope::deserialize(bytes).ok())
                .is_some_and(|envelope| envelope.matches(key.expose()))
        })
    }

    /// Returns the master key, creating and persisting it on first use.
    ///
    /// If another writer creates the key concurrently, its key wins and is
    /// returned.
    ///
    /// # Errors
    ///
    /// Same as [`KeyVault::unseal`], plus `StorageFailure` if the new key
    /// cannot be persisted.
    pub fn ensure_key(&self) -> StorageResult<Arc<MasterKey>> {
        self.enforce_policy()?;
        if let Some(bytes) = self.persistence.read_metadata()? {
            return self.open_envelope(&MasterKeyEnvelope::deserialize(&bytes)?);
        }

        let key = MasterKey::generate();
        let sealed = self
            .credential
            .seal(MASTER_KEY_AD, key.expose())
            .map_err(map_platform_error)?;
        let envelope = MasterKeyEnvelope::new(sealed, key.expose(), unix_now());
        match self
            .persistence
            .write_metadata_if_absent(&envelope.serialize()?)?
        {
            None => {
                tracing::info!("created master key");
                let key = Arc::new(key);
                self.remember(&key);
                Ok(key)
            }
            Some(existing) => {
                tracing::debug!("master key created concurrently, using the stored one");
                self.open_envelope(&MasterKeyEnvelope::deserialize(&existing)?)
            }
        }
    }

    /// Replaces the master key and re-encrypts every record under the new one.
    ///
    /// The new key and the re-encrypted records are published together; on
    /// failure the old key and records stay in effect. A store without a key
    /// simply gets its first one.
    ///
    /// # Errors
    ///
    /// Vault errors as for [`KeyVault::unseal`], `AuthenticationFailed` if an
    /// existing record does not decrypt, or `StorageFailure`.
    pub fn rotate(&self) -> StorageResult<()> {
        self.enforce_policy()?;
        let builder = self.persistence.begin_generation()?;
        let Some(previous) = builder.previous_metadata()? else {
            drop(builder);
            self.ensure_key()?;
            return Ok(());
        };
        let previous = MasterKeyEnvelope::deserialize(&previous)?;
        let old_key = self.unseal_envelope(&previous)?;

        let new_key = MasterKey::generate();
        let sealed = self
            .credential
            .seal(MASTER_KEY_AD, new_key.expose())
            .map_err(map_platform_error)?;
        builder.put_metadata(
            &previous
                .rotated(sealed, new_key.expose(), unix_now())
                .serialize()?,
        )?;

        let old_engine = CipherEngine::new(&old_key);
        let new_engine = CipherEngine::new(&new_key);
        let mut rewrapped = 0usize;
        builder.for_each_previous_record(|record| {
            let plaintext = record.open(&old_engine, &record.key)?;
            builder.put_record(&Record::seal(&new_engine, &record.key, &plaintext)?)?;
            rewrapped += 1;
            Ok(())
        })?;
        let generation = builder.commit()?;

        self.lock();
        self.remember(&Arc::new(new_key));
        tracing::info!(generation, records = rewrapped, "master key rotated");
        Ok(())
    }

    /// Drops the cached unsealed key, if any.
    pub fn lock(&self) {
        let dropped = self
            .cached
            .lock()
            .is_ok_and(|mut cached| cached.take().is_some());
        if dropped {
            tracing::debug!("dropped cached master key");
        }
    }

    /// Returns `true` if a master key exists for this store.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the metadata slot cannot be read.
    pub fn has_key(&self) -> StorageResult<bool> {
        Ok(self.persistence.read_metadata()?.is_some())
    }

    fn enforce_policy(&self) -> StorageResult<()> {
        if self.policy != CredentialPolicy::RequireActiveCredential {
            return Ok(());
        }
        match self.credential.has_active_credential() {
            Ok(true) => Ok(()),
            Ok(false) => Err(StorageError::LockedOut(
                "no active device credential".to_string(),
            )),
            Err(err) => Err(StorageError::CredentialUnavailable(format!(
                "credential state unknown: {err}"
            ))),
        }
    }

    /// Returns the key for `envelope`, from the cache when it still matches.
    fn open_envelope(&self, envelope: &MasterKeyEnvelope) -> StorageResult<Arc<MasterKey>> {
        if let Some(key) = self.cached_key(envelope) {
            return Ok(key);
        }
        let key = Arc::new(self.unseal_envelope(envelope)?);
        self.remember(&key);
        Ok(key)
    }

    fn unseal_envelope(&self, envelope: &MasterKeyEnvelope) -> StorageResult<MasterKey> {
        let bytes = Zeroizing::new(
            self.credential
                .unseal(MASTER_KEY_AD, &envelope.sealed_key)
                .map_err(map_platform_error)?,
        );
        let key = MasterKey::from_bytes(&bytes)?;
        if !envelope.matches(key.expose()) {
            return Err(StorageError::CredentialUnavailable(
                "unsealed master key failed its integrity check".to_string(),
            ));
        }
        tracing::debug!("unsealed master key");
        Ok(key)
    }

    fn cached_key(&self, envelope: &MasterKeyEnvelope) -> Option<Arc<MasterKey>> {
        if !self.cache_unsealed_key {
            return None;
        }
        let key = Arc::clone(&self.cached.lock().ok()?.as_ref()?.key);
        // Drop the key as soon as the credential is gone or the store rotated.
        if self.credential_active() && envelope.matches(key.expose()) {
            return Some(key);
        }
        self.lock();
        None
    }

    fn remember(&self, key: &Arc<MasterKey>) {
        if !self.cache_unsealed_key || !self.credential_active() {
            return;
        }
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(CachedKey {
                key: Arc::clone(key),
            });
        }
    }

    fn credential_active(&self) -> bool {
        matches!(self.credential.has_active_credential(), Ok(true))
    }
}

fn map_platform_error(err: PlatformError) -> StorageError {
    match err {
        PlatformError::LockedOut(message) => StorageError::LockedOut(message),
        PlatformError::Unavailable(message) | PlatformError::Rejected(message) => {
            StorageError::CredentialUnavailable(message)
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
