//! Master key envelope persistence helpers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{StorageError, StorageResult};

const ENVELOPE_VERSION: u32 = 1;
const KEY_CHECK_LABEL: &[u8] = b"sealkv:master-key-check";

/// Sealed master key as stored in the metadata slot.
#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(test, derive(Debug))]
pub struct MasterKeyEnvelope {
    pub version: u32,
    pub sealed_key: Vec<u8>,
    pub key_check: [u8; 32],
    pub created_at: u64,
    pub rotated_at: u64,
}

impl MasterKeyEnvelope {
    pub fn new(sealed_key: Vec<u8>, key: &[u8; 32], now: u64) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            sealed_key,
            key_check: key_check(key),
            created_at: now,
            rotated_at: now,
        }
    }

    /// Envelope for a rotated key, keeping the original creation time.
    pub fn rotated(&self, sealed_key: Vec<u8>, key: &[u8; 32], now: u64) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            sealed_key,
            key_check: key_check(key),
            created_at: self.created_at,
            rotated_at: now,
        }
    }

    /// Checks in constant time that `key` is the key this envelope was made for.
    pub fn matches(&self, key: &[u8; 32]) -> bool {
        key_check(key).ct_eq(&self.key_check).into()
    }

    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| StorageError::StorageFailure(format!("encode envelope: {err}")))?;
        Ok(bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> StorageResult<Self> {
        let envelope: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| StorageError::StorageFailure(format!("malformed envelope: {err}")))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(StorageError::StorageFailure(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

fn key_check(key: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_CHECK_LABEL);
    hasher.update(key);
    hasher.finalize().into()
}
