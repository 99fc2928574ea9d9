//! The encrypted key-value store.
//!
//! [`EncryptedStorage`] composes the vault, the cipher engine and the
//! persistence layer behind an async API. Blocking work (platform unseal,
//! file I/O) runs on tokio's blocking pool.
//!
//! Locking:
//!
//! - a store-wide `RwLock` is held shared by item operations and exclusively
//!   by [`clear`](EncryptedStorage::clear) and
//!   [`rotate_master_key`](EncryptedStorage::rotate_master_key);
//! - a per-key mutex orders `set_item`/`remove_item` on the same key.
//!
//! Once a mutation reaches the blocking pool it owns its lock guards, so
//! dropping the calling future does not interrupt it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as KeyMutex, RwLock};

use crate::cipher::CipherEngine;
use crate::config::StoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::persistence::{record_id, PersistenceLayer, Record};
use crate::platform::CredentialSubsystem;
use crate::probe::DeviceStateProbe;
use crate::vault::{KeyVault, MasterKey};

const KEY_LOCK_PRUNE_THRESHOLD: usize = 1024;
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Encrypted at-rest key-value store.
///
/// Values are UTF-8 strings. Each value is encrypted under a key derived from
/// the store's master key, which the platform credential subsystem seals.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use sealkv_core::platform::FileCredentialSubsystem;
/// use sealkv_core::{EncryptedStorage, StoreConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let credential = Arc::new(FileCredentialSubsystem::open("/tmp/sealkv-keys")?);
/// let store = EncryptedStorage::open(StoreConfig::new("/tmp/sealkv"), credential)?;
///
/// store.set_item("token", "abc123").await?;
/// assert_eq!(store.get_item("token").await?.as_deref(), Some("abc123"));
/// # Ok(())
/// # }
/// ```
pub struct EncryptedStorage {
    config: StoreConfig,
    persistence: Arc<PersistenceLayer>,
    vault: Arc<KeyVault>,
    probe: DeviceStateProbe,
    store_lock: Arc<RwLock<()>>,
    key_locks: KeyLocks,
}

impl std::fmt::Debug for EncryptedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EncryptedStorage {
    /// Opens (or creates) the store described by `config`.
    ///
    /// No credential work happens here; the master key is created or
    /// unsealed on first use.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid configuration and
    /// `StorageFailure` if the store directory cannot be prepared.
    pub fn open(
        config: StoreConfig,
        credential: Arc<dyn CredentialSubsystem>,
    ) -> StorageResult<Self> {
        config.validate()?;
        let persistence = Arc::new(PersistenceLayer::open(config.paths())?);
        let vault = Arc::new(KeyVault::new(
            Arc::clone(&credential),
            Arc::clone(&persistence),
            config.credential_policy,
            config.cache_unsealed_key,
        ));
        tracing::info!(
            store = %persistence.paths().store_dir().display(),
            policy = ?config.credential_policy,
            "opened encrypted storage"
        );
        Ok(Self {
            config,
            persistence,
            vault,
            probe: DeviceStateProbe::new(credential),
            store_lock: Arc::new(RwLock::new(())),
            key_locks: KeyLocks::default(),
        })
    }

    /// Returns the configuration this store was opened with.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Encrypts `value` and stores it under `key`, replacing any previous
    /// value.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty key, vault errors (`LockedOut`,
    /// `CredentialUnavailable`) or `StorageFailure`.
    pub async fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        validate_key(key)?;
        let store_guard = Arc::clone(&self.store_lock).read_owned().await;
        let key_guard = self.key_locks.lock_for(key).lock_owned().await;
        let value = zeroize::Zeroizing::new(value.as_bytes().to_vec());

        let mut guards = (store_guard, key_guard);
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let master_key = self.ensure_key().await?;
            let vault = Arc::clone(&self.vault);
            let key = key.to_string();
            let value = value.clone();
            // The guards travel with the blocking task and come back if the
            // write has to be redone under a newer master key.
            let (written, returned) = run_blocking(move || {
                let record = Record::seal(&CipherEngine::new(&master_key), &key, &value)?;
                Ok((vault.write_record(&master_key, &record)?, guards))
            })
            .await?;
            if written {
                return Ok(());
            }
            guards = returned;
            tracing::debug!(attempt, "master key changed during write, sealing again");
        }
        Err(StorageError::StorageFailure(
            "master key kept changing during write".to_string(),
        ))
    }

    /// Returns the value stored under `key`, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty key, `AuthenticationFailed` if the
    /// stored record was tampered with, vault errors or `StorageFailure`.
    pub async fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key)?;
        let _store_guard = Arc::clone(&self.store_lock).read_owned().await;

        let persistence = Arc::clone(&self.persistence);
        let owned_key = key.to_string();
        let (record, metadata) =
            run_blocking(move || persistence.read_with_metadata(&owned_key)).await?;
        let Some(record) = record else {
            return Ok(None);
        };
        let vault = Arc::clone(&self.vault);
        let master_key = self
            .with_credential(move || vault.unseal_metadata(metadata.as_deref()))
            .await?;
        let plaintext = record.open(&CipherEngine::new(&master_key), key)?;
        String::from_utf8(plaintext.to_vec())
            .map(Some)
            .map_err(|_| StorageError::authentication("stored value is not valid UTF-8"))
    }

    /// Removes the value stored under `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty key or `StorageFailure`.
    pub async fn remove_item(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let store_guard = Arc::clone(&self.store_lock).read_owned().await;
        let key_guard = self.key_locks.lock_for(key).lock_owned().await;

        let persistence = Arc::clone(&self.persistence);
        let key = key.to_string();
        run_blocking(move || {
            let _guards = (store_guard, key_guard);
            persistence.delete(&key).map(|_| ())
        })
        .await
    }

    /// Returns `true` if a value is stored under `key`. Does not unseal the
    /// master key.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty key or `StorageFailure`.
    pub async fn contains_item(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let store_guard = Arc::clone(&self.store_lock).read_owned().await;

        let persistence = Arc::clone(&self.persistence);
        let key = key.to_string();
        run_blocking(move || {
            let _guard = store_guard;
            persistence.contains(&key)
        })
        .await
    }

    /// Removes every value atomically. The master key is kept.
    ///
    /// # Errors
    ///
    /// `StorageFailure` if the store cannot be cleared; it is then unchanged.
    pub async fn clear(&self) -> StorageResult<()> {
        let store_guard = Arc::clone(&self.store_lock).write_owned().await;

        let persistence = Arc::clone(&self.persistence);
        run_blocking(move || {
            let _guard = store_guard;
            persistence.clear_all()
        })
        .await?;
        self.key_locks.prune();
        Ok(())
    }

    /// Reports whether the device has an active lock-screen or biometric
    /// credential. Never unseals the master key or touches storage.
    ///
    /// # Errors
    ///
    /// `ProbeUnavailable` if the platform cannot be queried.
    pub async fn is_device_protected(&self) -> StorageResult<bool> {
        let probe = self.probe.clone();
        run_blocking(move || probe.has_active_credential())
            .await
            .map_err(|err| match err {
                StorageError::ProbeUnavailable(_) => err,
                other => StorageError::ProbeUnavailable(other.to_string()),
            })
    }

    /// Generates a new master key and re-encrypts every value under it.
    ///
    /// Values and the sealed key switch over together; on failure the
    /// previous key stays in effect. When the credential timeout expires the
    /// call returns `LockedOut` while the rotation still runs to completion or
    /// rolls back in the background.
    ///
    /// # Errors
    ///
    /// Vault errors, `AuthenticationFailed` if a stored value no longer
    /// decrypts, or `StorageFailure`.
    pub async fn rotate_master_key(&self) -> StorageResult<()> {
        let store_guard = Arc::clone(&self.store_lock).write_owned().await;

        let vault = Arc::clone(&self.vault);
        self.with_credential(move || {
            let _guard = store_guard;
            vault.rotate()
        })
        .await
    }

    /// Creates the master key now instead of on first write.
    ///
    /// # Errors
    ///
    /// Vault errors or `StorageFailure`.
    pub async fn initialize(&self) -> StorageResult<()> {
        let _store_guard = Arc::clone(&self.store_lock).read_owned().await;
        self.ensure_key().await.map(|_| ())
    }

    /// Drops any cached unsealed master key.
    pub fn lock(&self) {
        self.vault.lock();
    }

    async fn ensure_key(&self) -> StorageResult<Arc<MasterKey>> {
        let vault = Arc::clone(&self.vault);
        self.with_credential(move || vault.ensure_key()).await
    }

    /// Runs platform credential work, giving up after the credential timeout.
    async fn with_credential<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StorageResult<T> + Send + 'static,
    {
        let timeout = self.config.credential_timeout();
        tokio::time::timeout(timeout, run_blocking(op))
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(timeout_ms = self.config.credential_timeout_ms, "credential request timed out");
                Err(StorageError::LockedOut(format!(
                    "credential request timed out after {}ms",
                    self.config.credential_timeout_ms
                )))
            })
    }
}

async fn run_blocking<T, F>(op: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StorageError::StorageFailure(format!("blocking task failed: {err}")))?
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

/// Per-key mutexes, created on demand.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<KeyMutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &str) -> Arc<KeyMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.len() >= KEY_LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        let lock = Arc::clone(
            locks
                .entry(record_id(key))
                .or_insert_with(|| Arc::new(KeyMutex::new(()))),
        );
        drop(locks);
        lock
    }

    /// Forgets mutexes nobody is waiting on.
    fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
