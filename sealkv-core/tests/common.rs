//! Common test utilities shared across integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sealkv_core::paths::StoragePaths;
use sealkv_core::persistence::record_id;
use sealkv_core::platform::MemoryCredentialSubsystem;
use sealkv_core::{CredentialPolicy, EncryptedStorage, StoreConfig};
use uuid::Uuid;

/// Namespace every test store lives in.
pub const NAMESPACE: &str = "integration";

/// Routes tracing output to the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Returns a fresh, not yet created, scratch root.
pub fn temp_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("sealkv-test-{}", Uuid::new_v4()));
    path
}

/// Removes a scratch root, ignoring errors.
pub fn cleanup_storage(root: &Path) {
    let _ = std::fs::remove_dir_all(root);
}

/// A store on a scratch root, backed by the in-memory credential subsystem.
pub struct TestStore {
    /// Storage root, removed on drop.
    pub root: PathBuf,
    /// Credential subsystem shared by every handle on `root`.
    pub credential: Arc<MemoryCredentialSubsystem>,
    /// The store under test.
    pub store: EncryptedStorage,
}

impl TestStore {
    /// Opens a store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Opens a store with `configure` applied to the default configuration.
    pub fn with_config(configure: impl FnOnce(StoreConfig) -> StoreConfig) -> Self {
        init_tracing();
        let root = temp_root();
        let credential = Arc::new(MemoryCredentialSubsystem::new());
        let config = configure(StoreConfig::new(&root).with_namespace(NAMESPACE));
        let store = EncryptedStorage::open(config, credential.clone()).expect("open store");
        Self {
            root,
            credential,
            store,
        }
    }

    /// Opens a store that requires an active device credential.
    #[allow(dead_code, reason = "used in tests")]
    pub fn requiring_credential() -> Self {
        Self::with_config(|config| {
            config.with_credential_policy(CredentialPolicy::RequireActiveCredential)
        })
    }

    /// Opens a store with the given credential timeout.
    #[allow(dead_code, reason = "used in tests")]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_config(|config| config.with_credential_timeout(timeout))
    }

    /// Reopens the same root with the same credential subsystem.
    #[allow(dead_code, reason = "used in tests")]
    pub fn reopen(&self) -> EncryptedStorage {
        EncryptedStorage::open(
            StoreConfig::new(&self.root).with_namespace(NAMESPACE),
            self.credential.clone(),
        )
        .expect("reopen store")
    }

    /// Returns the on-disk layout of the store.
    pub fn paths(&self) -> StoragePaths {
        StoragePaths::new(&self.root, NAMESPACE)
    }

    /// Returns the on-disk file of the record stored under `key`.
    #[allow(dead_code, reason = "used in tests")]
    pub fn record_file(&self, key: &str) -> PathBuf {
        let manifest = self.current_generation();
        self.paths().record_path(manifest, &record_id(key))
    }

    /// Returns the newest generation directory on disk.
    pub fn current_generation(&self) -> u64 {
        std::fs::read_dir(self.paths().store_dir())
            .expect("list store")
            .filter_map(Result::ok)
            .filter_map(|entry| {
                StoragePaths::parse_generation(&entry.file_name().to_string_lossy())
            })
            .max()
            .expect("a generation directory")
    }
}

impl Drop for TestStore {
    fn drop(&mut self) {
        cleanup_storage(&self.root);
    }
}
