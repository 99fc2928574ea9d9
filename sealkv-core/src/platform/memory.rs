//! In-memory credential subsystem for testing.
//!
//! Sealing is real `XChaCha20-Poly1305` under a random per-instance device key,
//! so tampering and cross-device opens fail the way they do on hardware. The
//! lock state, outages and prompt latency are switchable at runtime so tests
//! can drive every failure path of the vault and the probe.

#![allow(clippy::missing_panics_doc)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use super::CredentialSubsystem;
use crate::error::PlatformError;

const NONCE_SIZE: usize = 24;

/// In-memory [`CredentialSubsystem`].
///
/// **FOR TESTING ONLY**: the device key lives in process memory.
pub struct MemoryCredentialSubsystem {
    device_key: Zeroizing<[u8; 32]>,
    active_credential: AtomicBool,
    device_locked: AtomicBool,
    available: AtomicBool,
    probe_available: AtomicBool,
    prompt_delay: Mutex<Duration>,
    seal_calls: AtomicU64,
    unseal_calls: AtomicU64,
    probe_calls: AtomicU64,
}

impl MemoryCredentialSubsystem {
    /// Creates a subsystem with a fresh random device key and an active
    /// credential.
    #[must_use]
    pub fn new() -> Self {
        let mut device_key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *device_key);
        Self {
            device_key,
            active_credential: AtomicBool::new(true),
            device_locked: AtomicBool::new(false),
            available: AtomicBool::new(true),
            probe_available: AtomicBool::new(true),
            prompt_delay: Mutex::new(Duration::ZERO),
            seal_calls: AtomicU64::new(0),
            unseal_calls: AtomicU64::new(0),
            probe_calls: AtomicU64::new(0),
        }
    }

    /// Sets whether a lock-screen credential is configured.
    pub fn set_active_credential(&self, active: bool) {
        self.active_credential.store(active, Ordering::SeqCst);
    }

    /// Simulates the device being locked: unseal refuses with `LockedOut`.
    pub fn set_device_locked(&self, locked: bool) {
        self.device_locked.store(locked, Ordering::SeqCst);
    }

    /// Simulates a keystore outage: seal and unseal fail with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulates a failing lock-state query.
    pub fn set_probe_available(&self, available: bool) {
        self.probe_available.store(available, Ordering::SeqCst);
    }

    /// Makes every unseal block for `delay`, like a pending credential prompt.
    pub fn set_prompt_delay(&self, delay: Duration) {
        *self.prompt_delay.lock().unwrap() = delay;
    }

    /// Returns how many times `seal` was called.
    #[must_use]
    pub fn seal_calls(&self) -> u64 {
        self.seal_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times `unseal` was called.
    #[must_use]
    pub fn unseal_calls(&self) -> u64 {
        self.unseal_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times the lock state was queried.
    #[must_use]
    pub fn probe_calls(&self) -> u64 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&*self.device_key))
    }

    fn ensure_available(&self) -> Result<(), PlatformError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PlatformError::Unavailable("memory keystore offline".to_string()))
        }
    }
}

impl Default for MemoryCredentialSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialSubsystem for MemoryCredentialSubsystem {
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, PlatformError> {
        self.seal_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|err| PlatformError::Unavailable(err.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>, PlatformError> {
        self.unseal_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.prompt_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.ensure_available()?;
        if self.device_locked.load(Ordering::SeqCst) {
            return Err(PlatformError::LockedOut("device is locked".to_string()));
        }
        if sealed.len() < NONCE_SIZE {
            return Err(PlatformError::Rejected("sealed blob too short".to_string()));
        }
        let (nonce_bytes, payload) = sealed.split_at(NONCE_SIZE);
        self.cipher()
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: payload,
                    aad: associated_data,
                },
            )
            .map_err(|err| PlatformError::Rejected(err.to_string()))
    }

    fn has_active_credential(&self) -> Result<bool, PlatformError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.probe_available.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("lock-state query failed".to_string()));
        }
        Ok(self.active_credential.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_subsystem_round_trip() {
        let subsystem = MemoryCredentialSubsystem::new();
        let sealed = subsystem.seal(b"ad", b"secret").expect("seal");
        assert_ne!(&sealed[NONCE_SIZE..], b"secret");
        let opened = subsystem.unseal(b"ad", &sealed).expect("unseal");
        assert_eq!(opened, b"secret");
    }

    #[test]
    fn test_memory_subsystem_rejects_other_device_and_ad() {
        let subsystem = MemoryCredentialSubsystem::new();
        let sealed = subsystem.seal(b"ad", b"secret").expect("seal");

        let err = subsystem.unseal(b"other", &sealed).expect_err("wrong ad");
        assert!(matches!(err, PlatformError::Rejected(_)));

        let other = MemoryCredentialSubsystem::new();
        let err = other.unseal(b"ad", &sealed).expect_err("other device");
        assert!(matches!(err, PlatformError::Rejected(_)));
    }

    #[test]
    fn test_memory_subsystem_toggles() {
        let subsystem = MemoryCredentialSubsystem::new();
        let sealed = subsystem.seal(b"ad", b"secret").expect("seal");

        subsystem.set_device_locked(true);
        assert!(matches!(
            subsystem.unseal(b"ad", &sealed),
            Err(PlatformError::LockedOut(_))
        ));
        subsystem.set_device_locked(false);

        subsystem.set_available(false);
        assert!(matches!(
            subsystem.seal(b"ad", b"x"),
            Err(PlatformError::Unavailable(_))
        ));
        subsystem.set_available(true);

        assert!(subsystem.has_active_credential().expect("probe"));
        subsystem.set_active_credential(false);
        assert!(!subsystem.has_active_credential().expect("probe"));
        subsystem.set_probe_available(false);
        assert!(subsystem.has_active_credential().is_err());

        assert_eq!(subsystem.seal_calls(), 2);
        assert_eq!(subsystem.unseal_calls(), 1);
        assert_eq!(subsystem.probe_calls(), 3);
    }
}
