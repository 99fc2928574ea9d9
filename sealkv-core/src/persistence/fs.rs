//! Crash-safe file primitives.
//!
//! Writes follow write-to-temp, `fsync`, rename, directory `fsync`, so a
//! reader sees either the complete old file or the complete new one.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::error::{StorageError, StorageResult};
use crate::paths::StoragePaths;

/// Reads `path`, mapping a missing file to `None`.
pub fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::storage(
            format!("read '{}'", path.display()),
            &err,
        )),
    }
}

/// Atomically replaces `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let temp_path = StoragePaths::temp_path_for(path);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .map_err(|err| {
            StorageError::storage(format!("create '{}'", temp_path.display()), &err)
        })?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            StorageError::storage(format!("write '{}'", temp_path.display()), &err)
        })?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        StorageError::storage(
            format!("rename '{}' to '{}'", temp_path.display(), path.display()),
            &err,
        )
    })?;

    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Removes `path`. Returns `false` if it did not exist.
pub fn remove_optional(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            if let Some(parent) = path.parent() {
                sync_dir(parent)?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StorageError::storage(
            format!("remove '{}'", path.display()),
            &err,
        )),
    }
}

/// Creates `dir` (and parents) and makes the new entry durable.
pub fn create_dir_durable(dir: &Path) -> StorageResult<()> {
    fs::create_dir_all(dir)
        .map_err(|err| StorageError::storage(format!("create '{}'", dir.display()), &err))?;
    if let Some(parent) = dir.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Flushes directory entries (renames, unlinks) to disk.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> StorageResult<()> {
    fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|err| StorageError::storage(format!("sync '{}'", dir.display()), &err))
}

// Directory handles cannot be fsynced portably elsewhere; rename is still atomic.
#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
pub fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
