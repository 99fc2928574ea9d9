//! File-backed credential subsystem for desktop development.
//!
//! The device key is a 32-byte file kept outside the store directory. It is
//! read for every seal/unseal so that deleting or replacing it takes effect
//! immediately. This backend offers no hardware protection; use it for
//! development hosts and the CLI only.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use super::CredentialSubsystem;
use crate::error::PlatformError;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const DEVICE_KEY_FILENAME: &str = "device.key";

/// Development [`CredentialSubsystem`] keeping its device key in a file.
///
/// The device counts as protected while the key file exists and, on Unix, is
/// readable by its owner only.
#[derive(Debug, Clone)]
pub struct FileCredentialSubsystem {
    key_path: PathBuf,
}

impl FileCredentialSubsystem {
    /// Opens the device key in `key_dir`, generating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Unavailable`] if the directory or key file
    /// cannot be created.
    pub fn open(key_dir: impl AsRef<Path>) -> Result<Self, PlatformError> {
        let key_dir = key_dir.as_ref();
        fs::create_dir_all(key_dir).map_err(|err| {
            PlatformError::Unavailable(format!(
                "create key directory '{}': {err}",
                key_dir.display()
            ))
        })?;
        let key_path = key_dir.join(DEVICE_KEY_FILENAME);
        if !key_path.exists() {
            create_device_key(&key_path)?;
            tracing::info!(path = %key_path.display(), "generated development device key");
        }
        Ok(Self { key_path })
    }

    /// Returns the location of the device key file.
    #[must_use]
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, PlatformError> {
        let bytes = Zeroizing::new(fs::read(&self.key_path).map_err(|err| {
            PlatformError::Unavailable(format!("read device key: {err}"))
        })?);
        if bytes.len() != KEY_SIZE {
            return Err(PlatformError::Unavailable(format!(
                "device key has invalid length: {} (expected {KEY_SIZE})",
                bytes.len()
            )));
        }
        Ok(XChaCha20Poly1305::new(Key::from_slice(&bytes)))
    }
}

fn create_device_key(path: &Path) -> Result<(), PlatformError> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut *key);

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|err| PlatformError::Unavailable(format!("create device key: {err}")))?;
    file.write_all(&*key)
        .and_then(|()| file.sync_all())
        .map_err(|err| PlatformError::Unavailable(format!("write device key: {err}")))
}

impl CredentialSubsystem for FileCredentialSubsystem {
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
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
        if sealed.len() < NONCE_SIZE {
            return Err(PlatformError::Rejected("sealed blob too short".to_string()));
        }
        let cipher = self.cipher()?;
        let (nonce_bytes, payload) = sealed.split_at(NONCE_SIZE);
        cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: payload,
                    aad: associated_data,
                },
            )
            .map_err(|_| PlatformError::Rejected("device key does not open blob".to_string()))
    }

    fn has_active_credential(&self) -> Result<bool, PlatformError> {
        let metadata = match fs::metadata(&self.key_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(PlatformError::Unavailable(format!(
                    "stat device key: {err}"
                )))
            }
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            Ok(metadata.is_file() && metadata.permissions().mode().trailing_zeros() >= 6)
        }
        #[cfg(not(unix))]
        {
            Ok(metadata.is_file())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_subsystem_persists_device_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = FileCredentialSubsystem::open(dir.path()).expect("open");
        let sealed = first.seal(b"ad", b"secret").expect("seal");

        let second = FileCredentialSubsystem::open(dir.path()).expect("reopen");
        assert_eq!(second.unseal(b"ad", &sealed).expect("unseal"), b"secret");
        assert!(second.has_active_credential().expect("probe"));
    }

    #[test]
    fn test_file_subsystem_reports_missing_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = FileCredentialSubsystem::open(dir.path()).expect("open");
        let sealed = subsystem.seal(b"ad", b"secret").expect("seal");

        fs::remove_file(subsystem.key_path()).expect("remove key");
        assert!(!subsystem.has_active_credential().expect("probe"));
        assert!(matches!(
            subsystem.unseal(b"ad", &sealed),
            Err(PlatformError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_subsystem_world_readable_key_is_unprotected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = FileCredentialSubsystem::open(dir.path()).expect("open");
        fs::set_permissions(subsystem.key_path(), fs::Permissions::from_mode(0o644))
            .expect("chmod");
        assert!(!subsystem.has_active_credential().expect("probe"));
    }
}
