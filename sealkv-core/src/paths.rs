//! Storage path helpers.

use std::path::{Path, PathBuf};

const MANIFEST_FILENAME: &str = "CURRENT";
const LOCK_FILENAME: &str = "lock";
const METADATA_FILENAME: &str = "master.key";
const GENERATION_PREFIX: &str = "gen-";
const RECORD_EXTENSION: &str = "rec";
const TEMP_EXTENSION: &str = "tmp";

/// Paths for store artifacts under `<root>/<namespace>`.
///
/// ```text
/// <root>/<namespace>/
///   lock                      cross-process mutation lock
///   CURRENT                   manifest naming the active generation
///   gen-0000000000000003/
///     master.key              sealed master key envelope
///     <sha256(key)>.rec       one file per record
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
    store_dir: PathBuf,
}

impl StoragePaths {
    /// Builds storage paths rooted at `root` for `namespace`.
    #[must_use]
    pub fn new(root: impl AsRef<Path>, namespace: &str) -> Self {
        let root = root.as_ref().to_path_buf();
        let store_dir = root.join(namespace);
        Self { root, store_dir }
    }

    /// Returns the storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory owned by this store instance.
    #[must_use]
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Returns the path to the manifest file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.store_dir.join(MANIFEST_FILENAME)
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.store_dir.join(LOCK_FILENAME)
    }

    /// Returns the directory holding generation `generation`.
    #[must_use]
    pub fn generation_dir(&self, generation: u64) -> PathBuf {
        self.store_dir
            .join(format!("{GENERATION_PREFIX}{generation:016x}"))
    }

    /// Returns the reserved metadata slot inside a generation.
    #[must_use]
    pub fn metadata_path(&self, generation: u64) -> PathBuf {
        self.generation_dir(generation).join(METADATA_FILENAME)
    }

    /// Returns the record file for `record_id` inside a generation.
    #[must_use]
    pub fn record_path(&self, generation: u64, record_id: &str) -> PathBuf {
        self.generation_dir(generation)
            .join(format!("{record_id}.{RECORD_EXTENSION}"))
    }

    /// Parses a generation number from a directory name, if it is one.
    #[must_use]
    pub fn parse_generation(name: &str) -> Option<u64> {
        let digits = name.strip_prefix(GENERATION_PREFIX)?;
        if digits.len() != 16 {
            return None;
        }
        u64::from_str_radix(digits, 16).ok()
    }

    /// Returns `true` when `name` is a record file name.
    #[must_use]
    pub fn is_record_file(name: &str) -> bool {
        Path::new(name)
            .extension()
            .is_some_and(|ext| ext == RECORD_EXTENSION)
    }

    /// Returns `true` when `name` is a leftover temporary file.
    #[must_use]
    pub fn is_temp_file(name: &str) -> bool {
        name.starts_with('.')
            && Path::new(name)
                .extension()
                .is_some_and(|ext| ext == TEMP_EXTENSION)
    }

    /// Returns a unique temporary sibling for `target`.
    #[must_use]
    pub fn temp_path_for(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_name = format!(".{name}.{}.{TEMP_EXTENSION}", uuid::Uuid::new_v4().simple());
        target.with_file_name(temp_name)
    }
}
