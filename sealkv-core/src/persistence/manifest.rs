//! The `CURRENT` manifest naming the active generation.

use serde::{Deserialize, Serialize};

use super::fs;
use crate::error::{StorageError, StorageResult};
use crate::paths::StoragePaths;

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub generation: u64,
}

impl Manifest {
    pub const fn new(generation: u64) -> Self {
        Self {
            version: MANIFEST_VERSION,
            generation,
        }
    }

    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| StorageError::StorageFailure(format!("encode manifest: {err}")))?;
        Ok(bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> StorageResult<Self> {
        let manifest: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| StorageError::StorageFailure(format!("corrupt manifest: {err}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(StorageError::StorageFailure(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Loads the manifest, or `None` for a store that was never initialized.
    pub fn load(paths: &StoragePaths) -> StorageResult<Option<Self>> {
        fs::read_optional(&paths.manifest_path())?
            .map(|bytes| Self::deserialize(&bytes))
            .transpose()
    }

    /// Atomically points the store at this manifest's generation.
    pub fn publish(&self, paths: &StoragePaths) -> StorageResult<()> {
        fs::write_atomic(&paths.manifest_path(), &self.serialize()?)
    }
}
