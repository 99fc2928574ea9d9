//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::paths::StoragePaths;

/// Default namespace used when the host does not pick one.
pub const DEFAULT_NAMESPACE: &str = "sealkv";

const DEFAULT_CREDENTIAL_TIMEOUT_MS: u64 = 30_000;

/// Whether reads and writes require an active device credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    /// Device protection is informational only; the master key is unsealed
    /// whenever the platform allows it.
    #[default]
    Advisory,
    /// Unsealing fails with `LockedOut` unless the platform reports an
    /// active lock-screen or biometric credential.
    RequireActiveCredential,
}

/// Configuration for an [`EncryptedStorage`](crate::EncryptedStorage) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory under which the store keeps its files.
    pub root: PathBuf,
    /// Sub-directory of `root` owned by this store; isolates stores sharing a root.
    pub namespace: String,
    /// Device-credential requirement for unsealing the master key.
    pub credential_policy: CredentialPolicy,
    /// Upper bound on platform credential work (prompts, unseal) in milliseconds.
    pub credential_timeout_ms: u64,
    /// Keep the unsealed master key across operations while the platform
    /// reports an active credential.
    pub cache_unsealed_key: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            namespace: DEFAULT_NAMESPACE.to_string(),
            credential_policy: CredentialPolicy::default(),
            credential_timeout_ms: DEFAULT_CREDENTIAL_TIMEOUT_MS,
            cache_unsealed_key: false,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration rooted at `root` with default settings.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the JSON is malformed or the result does
    /// not validate.
    pub fn from_json(json: &str) -> StorageResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| StorageError::invalid_argument(format!("config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the credential policy.
    #[must_use]
    pub const fn with_credential_policy(mut self, policy: CredentialPolicy) -> Self {
        self.credential_policy = policy;
        self
    }

    /// Sets the credential timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_credential_timeout(mut self, timeout: Duration) -> Self {
        self.credential_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enables or disables caching of the unsealed master key.
    #[must_use]
    pub const fn with_cache_unsealed_key(mut self, cache: bool) -> Self {
        self.cache_unsealed_key = cache;
        self
    }

    /// Returns the credential timeout as a [`Duration`].
    #[must_use]
    pub const fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }

    /// Returns the on-disk layout described by this configuration.
    #[must_use]
    pub fn paths(&self) -> StoragePaths {
        StoragePaths::new(&self.root, &self.namespace)
    }

    /// Checks the configuration for values the store cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` describing the first offending field.
    pub fn validate(&self) -> StorageResult<()> {
        if self.namespace.is_empty() {
            return Err(StorageError::invalid_argument("namespace must not be empty"));
        }
        if self
            .namespace
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
            || self.namespace.starts_with('.')
        {
            return Err(StorageError::invalid_argument(format!(
                "namespace '{}' must be a plain directory name",
                self.namespace
            )));
        }
        if self.credential_timeout_ms == 0 {
            return Err(StorageError::invalid_argument(
                "credential_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}
