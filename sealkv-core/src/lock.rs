//! Storage lock for serializing mutations across processes.
//!
//! Backed by an advisory lock on `<store>/lock` (`flock` on Unix,
//! `LockFileEx` on Windows, via the standard library). Every guard opens its
//! own handle, so guards conflict with each other even inside one process:
//!
//! - single-record writes hold the lock **shared** and run side by side;
//! - generation commits (clear, rotation, key creation) hold it **exclusive**.
//!
//! Per-key ordering inside a process is the facade's job, not this lock's.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

use crate::error::{StorageError, StorageResult};

/// A file-backed reader/writer lock shared by all processes using a store.
#[derive(Debug, Clone)]
pub struct StorageLock {
    path: PathBuf,
}

/// Guard that holds the lock (shared or exclusive) for its lifetime.
#[derive(Debug)]
pub struct StorageLockGuard {
    file: File,
}

impl StorageLock {
    /// Opens or creates the lock file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StorageError::storage("create lock directory", &err))?;
        }
        open_handle(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Acquires the lock exclusively, blocking until it is available.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired.
    pub fn exclusive(&self) -> StorageResult<StorageLockGuard> {
        let file = open_handle(&self.path)?;
        file.lock()
            .map_err(|err| StorageError::storage("acquire exclusive storage lock", &err))?;
        Ok(StorageLockGuard { file })
    }

    /// Acquires the lock in shared mode, blocking while an exclusive holder
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired.
    pub fn shared(&self) -> StorageResult<StorageLockGuard> {
        let file = open_handle(&self.path)?;
        file.lock_shared()
            .map_err(|err| StorageError::storage("acquire shared storage lock", &err))?;
        Ok(StorageLockGuard { file })
    }

    /// Attempts to acquire the lock exclusively without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt fails for reasons other than the lock
    /// being held elsewhere.
    pub fn try_exclusive(&self) -> StorageResult<Option<StorageLockGuard>> {
        let file = open_handle(&self.path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(StorageLockGuard { file })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(err)) => {
                Err(StorageError::storage("try storage lock", &err))
            }
        }
    }
}

impl Drop for StorageLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_handle(path: &Path) -> StorageResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| StorageError::storage("open lock file", &err))
}
