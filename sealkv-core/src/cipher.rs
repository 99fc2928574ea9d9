//! Authenticated encryption of individual values.
//!
//! Values are encrypted with `XChaCha20-Poly1305` under a record key derived
//! from the master key with HKDF-SHA256. Each encryption draws a fresh 24-byte
//! nonce from the OS RNG; at 192 bits random nonces do not collide at any
//! realistic record volume, so no nonce state is persisted.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Key, Tag, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{StorageError, StorageResult};
use crate::vault::MasterKey;

/// Size of the `XChaCha20` nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of the `Poly1305` authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const RECORD_KEY_INFO: &[u8] = b"sealkv:record-key:v1";

/// Output of [`CipherEngine::encrypt`].
#[derive(Clone, PartialEq, Eq)]
pub struct SealedValue {
    /// Ciphertext without the tag; same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Random nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
    /// Detached authentication tag.
    pub tag: [u8; TAG_SIZE],
}

impl std::fmt::Debug for SealedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedValue")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("nonce", &hex::encode(self.nonce))
            .finish_non_exhaustive()
    }
}

/// Value encryption bound to one master key.
///
/// Holding a `CipherEngine` keeps only the derived record key, never the
/// master key itself.
pub struct CipherEngine {
    cipher: XChaCha20Poly1305,
}

impl CipherEngine {
    /// Derives the record key from `master_key`.
    ///
    /// # Panics
    ///
    /// Does not panic in practice: a 32-byte output is always within the
    /// HKDF-SHA256 length limit.
    #[must_use]
    pub fn new(master_key: &MasterKey) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, master_key.expose());
        let mut record_key = Zeroizing::new([0u8; 32]);
        hkdf.expand(RECORD_KEY_INFO, &mut *record_key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&*record_key)),
        }
    }

    /// Encrypts `plaintext`, authenticating `associated_data` alongside it.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the AEAD refuses the input (only possible
    /// for plaintexts beyond the cipher's length limit).
    pub fn encrypt(&self, associated_data: &[u8], plaintext: &[u8]) -> StorageResult<SealedValue> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), associated_data, &mut buffer)
            .map_err(|_| {
                StorageError::StorageFailure("XChaCha20-Poly1305 encryption failed".to_string())
            })?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok(SealedValue {
            ciphertext: buffer,
            nonce,
            tag: tag_bytes,
        })
    }

    /// Decrypts and authenticates a value.
    ///
    /// Fails closed: any length mismatch or tag failure yields
    /// `AuthenticationFailed` and no plaintext.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` if the value was tampered with, sealed
    /// under another key or bound to other associated data.
    pub fn decrypt(
        &self,
        associated_data: &[u8],
        ciphertext: &[u8],
        nonce: &[u8],
        tag: &[u8],
    ) -> StorageResult<Zeroizing<Vec<u8>>> {
        if nonce.len() != NONCE_SIZE {
            return Err(StorageError::authentication(format!(
                "nonce length {} (expected {NONCE_SIZE})",
                nonce.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(StorageError::authentication(format!(
                "tag length {} (expected {TAG_SIZE})",
                tag.len()
            )));
        }

        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        self.cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                associated_data,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| StorageError::authentication("tag mismatch"))?;
        Ok(buffer)
    }
}
