//! Encrypted record format.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cipher::CipherEngine;
use crate::error::{StorageError, StorageResult};

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

const RECORD_AD_LABEL: &[u8] = b"sealkv:record";

/// One encrypted key/value pair as persisted on disk.
///
/// Records are immutable: an update writes a complete replacement.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Caller-chosen key; non-empty and unique within a store.
    pub key: String,
    /// Encrypted value, without the tag.
    pub ciphertext: Vec<u8>,
    /// AEAD nonce.
    pub nonce: Vec<u8>,
    /// AEAD authentication tag.
    pub tag: Vec<u8>,
    /// Record format version.
    pub version: u16,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("id", &record_id(&self.key))
            .field("ciphertext_len", &self.ciphertext.len())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Record {
    /// Encrypts `plaintext` into a record for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn seal(engine: &CipherEngine, key: &str, plaintext: &[u8]) -> StorageResult<Self> {
        let sealed = engine.encrypt(&associated_data(key, RECORD_VERSION), plaintext)?;
        Ok(Self {
            key: key.to_string(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            tag: sealed.tag.to_vec(),
            version: RECORD_VERSION,
        })
    }

    /// Decrypts the record, checking that it belongs to `expected_key`.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` if the record was tampered with, moved
    /// under another key, or sealed with a different master key.
    pub fn open(&self, engine: &CipherEngine, expected_key: &str) -> StorageResult<Zeroizing<Vec<u8>>> {
        if self.key != expected_key {
            return Err(StorageError::authentication(format!(
                "record {} is not bound to the requested key",
                record_id(expected_key)
            )));
        }
        engine.decrypt(
            &associated_data(expected_key, self.version),
            &self.ciphertext,
            &self.nonce,
            &self.tag,
        )
    }

    /// Returns the file-system safe identifier of this record.
    #[must_use]
    pub fn id(&self) -> String {
        record_id(&self.key)
    }

    /// Serializes the record to CBOR.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if serialization fails.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| StorageError::StorageFailure(format!("encode record: {err}")))?;
        Ok(bytes)
    }

    /// Parses a record from CBOR.
    ///
    /// A record that cannot be parsed is indistinguishable from a tampered
    /// one, so failures surface as `AuthenticationFailed`.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` for malformed bytes or an unsupported
    /// version.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let record: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| StorageError::authentication(format!("malformed record: {err}")))?;
        if record.version != RECORD_VERSION {
            return Err(StorageError::authentication(format!(
                "unsupported record version {}",
                record.version
            )));
        }
        Ok(record)
    }
}

/// Hex SHA-256 of the key; names the record file without leaking the key.
#[must_use]
pub fn record_id(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// AEAD associated data: `label || version (BE) || key`.
fn associated_data(key: &str, version: u16) -> Vec<u8> {
    let mut aad = Vec::with_capacity(RECORD_AD_LABEL.len() + 2 + key.len());
    aad.extend_from_slice(RECORD_AD_LABEL);
    aad.extend_from_slice(&version.to_be_bytes());
    aad.extend_from_slice(key.as_bytes());
    aad
}
