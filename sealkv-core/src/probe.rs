//! Device lock-state probe.

use std::sync::Arc;

use crate::error::{StorageError, StorageResult};
use crate::platform::CredentialSubsystem;

/// Reports whether the device has a lock-screen or biometric credential.
///
/// Every call queries the platform; nothing is cached, and the vault and
/// persistence layer are never touched.
#[derive(Clone)]
pub struct DeviceStateProbe {
    credential: Arc<dyn CredentialSubsystem>,
}

impl std::fmt::Debug for DeviceStateProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStateProbe").finish_non_exhaustive()
    }
}

impl DeviceStateProbe {
    /// Creates a probe backed by `credential`.
    #[must_use]
    pub fn new(credential: Arc<dyn CredentialSubsystem>) -> Self {
        Self { credential }
    }

    /// Queries the current credential state.
    ///
    /// # Errors
    ///
    /// Returns `ProbeUnavailable` if the platform cannot be queried.
    pub fn has_active_credential(&self) -> StorageResult<bool> {
        self.credential.has_active_credential().map_err(|err| {
            tracing::warn!(error = %err, "device state probe failed");
            StorageError::ProbeUnavailable(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::platform::MemoryCredentialSubsystem;

    #[test]
    fn test_probe_reflects_every_change() {
        let credential = Arc::new(MemoryCredentialSubsystem::new());
        let probe = DeviceStateProbe::new(credential.clone());

        assert!(probe.has_active_credential().expect("probe"));
        credential.set_active_credential(false);
        assert!(!probe.has_active_credential().expect("probe"));
        credential.set_active_credential(true);
        assert!(probe.has_active_credential().expect("probe"));
        assert_eq!(credential.probe_calls(), 3);
        assert_eq!(credential.unseal_calls(), 0);
    }

    #[test]
    fn test_probe_failure_is_probe_unavailable() {
        let credential = Arc::new(MemoryCredentialSubsystem::new());
        let probe = DeviceStateProbe::new(credential.clone());
        credential.set_probe_available(false);

        let err = probe.has_active_credential().expect_err("probe down");
        assert_eq!(err.kind(), ErrorKind::ProbeUnavailable);
    }
}
