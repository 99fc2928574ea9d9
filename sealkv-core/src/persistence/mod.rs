//! Durable, crash-safe storage of encrypted records.
//!
//! The store directory holds numbered generation directories and a `CURRENT`
//! manifest naming the live one. Single-record writes go straight into the
//! live generation with an atomic rename. Whole-store changes (clear, key
//! rotation) build a fresh generation off to the side and publish it by
//! replacing `CURRENT`, so a crash leaves either the old generation or the new
//! one in effect, never a mix.
//!
//! Readers do not lock. A reader that raced with a commit notices the
//! generation changed underneath it and retries against the new one.

mod fs;
mod manifest;
pub mod record;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use manifest::Manifest;
pub use record::{record_id, Record, RECORD_VERSION};

use crate::error::{StorageError, StorageResult};
use crate::lock::{StorageLock, StorageLockGuard};
use crate::paths::StoragePaths;

const MAX_READ_ATTEMPTS: usize = 8;

/// File-system persistence for one store (root + namespace).
#[derive(Debug)]
pub struct PersistenceLayer {
    paths: StoragePaths,
    lock: StorageLock,
}

impl PersistenceLayer {
    /// Opens the store directory, creating an empty store on first use.
    ///
    /// Leftovers of interrupted commits (unpublished generations, temp files)
    /// are removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the directory cannot be prepared or the
    /// manifest is unreadable.
    pub fn open(paths: StoragePaths) -> StorageResult<Self> {
        fs::create_dir_durable(paths.store_dir())?;
        let lock = StorageLock::open(&paths.lock_path())?;
        let layer = Self { paths, lock };

        let guard = layer.lock.exclusive()?;
        let generation = if let Some(manifest) = Manifest::load(&layer.paths)? {
            if !layer.paths.generation_dir(manifest.generation).is_dir() {
                return Err(StorageError::StorageFailure(format!(
                    "manifest names missing generation {}",
                    manifest.generation
                )));
            }
            manifest.generation
        } else {
            fs::create_dir_durable(&layer.paths.generation_dir(1))?;
            Manifest::new(1).publish(&layer.paths)?;
            tracing::info!(store = %layer.paths.store_dir().display(), "initialized empty store");
            1
        };
        layer.collect_garbage(generation, &guard)?;
        drop(guard);

        Ok(layer)
    }

    /// Returns the paths of this store.
    #[must_use]
    pub const fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Returns the live generation number.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the manifest is missing or corrupt.
    pub fn current_generation(&self) -> StorageResult<u64> {
        Manifest::load(&self.paths)?
            .map(|manifest| manifest.generation)
            .ok_or_else(|| StorageError::StorageFailure("store manifest is missing".to_string()))
    }

    /// Reads the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` for an undecodable record and
    /// `StorageFailure` for I/O errors.
    pub fn read(&self, key: &str) -> StorageResult<Option<Record>> {
        let id = record_id(key);
        let bytes = self.with_stable_generation(|generation| {
            fs::read_optional(&self.paths.record_path(generation, &id))
        })?;
        bytes.map(|bytes| Record::decode(&bytes)).transpose()
    }

    /// Reads the record under `key` together with the metadata slot of the
    /// same generation, so the record is always paired with the master key
    /// that sealed it.
    ///
    /// # Errors
    ///
    /// Same as [`PersistenceLayer::read`].
    pub fn read_with_metadata(
        &self,
        key: &str,
    ) -> StorageResult<(Option<Record>, Option<Vec<u8>>)> {
        let id = record_id(key);
        let (record, metadata) = self.with_stable_generation(|generation| {
            let record = fs::read_optional(&self.paths.record_path(generation, &id))?;
            let metadata = fs::read_optional(&self.paths.metadata_path(generation))?;
            Ok((record, metadata))
        })?;
        Ok((record.map(|bytes| Record::decode(&bytes)).transpose()?, metadata))
    }

    /// Returns `true` when a record exists under `key`, without decoding it.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store cannot be inspected.
    pub fn contains(&self, key: &str) -> StorageResult<bool> {
        let id = record_id(key);
        self.with_stable_generation(|generation| {
            let path = self.paths.record_path(generation, &id);
            path.try_exists()
                .map_err(|err| StorageError::storage(format!("stat '{}'", path.display()), &err))
        })
    }

    /// Writes (or replaces) `record` in the live generation.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the record cannot be made durable.
    pub fn write(&self, record: &Record) -> StorageResult<()> {
        self.write_if_metadata(record, |_| true).map(|_| ())
    }

    /// Writes `record` into the live generation only if `accept` approves
    /// that generation's metadata slot. Returns `false` without writing
    /// otherwise.
    ///
    /// The metadata slot cannot change between the check and the write.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the slot cannot be read or the record
    /// cannot be made durable.
    pub fn write_if_metadata(
        &self,
        record: &Record,
        accept: impl FnOnce(Option<&[u8]>) -> bool,
    ) -> StorageResult<bool> {
        let bytes = record.encode()?;
        let _guard = self.lock.shared()?;
        let generation = self.current_generation()?;
        let metadata = fs::read_optional(&self.paths.metadata_path(generation))?;
        if !accept(metadata.as_deref()) {
            tracing::debug!(record = %record.id(), generation, "metadata rejected, record not written");
            return Ok(false);
        }
        fs::write_atomic(&self.paths.record_path(generation, &record.id()), &bytes)?;
        tracing::debug!(record = %record.id(), generation, "record written");
        Ok(true)
    }

    /// Deletes the record under `key`. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the record file cannot be removed.
    pub fn delete(&self, key: &str) -> StorageResult<bool> {
        let id = record_id(key);
        let _guard = self.lock.shared()?;
        let generation = self.current_generation()?;
        let removed = fs::remove_optional(&self.paths.record_path(generation, &id))?;
        tracing::debug!(record = %id, generation, removed, "record deleted");
        Ok(removed)
    }

    /// Returns every key currently stored.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` if a record cannot be decoded and
    /// `StorageFailure` for I/O errors.
    pub fn list_keys(&self) -> StorageResult<BTreeSet<String>> {
        self.with_stable_generation(|generation| {
            let mut keys = BTreeSet::new();
            for path in record_files(&self.paths.generation_dir(generation))? {
                if let Some(bytes) = fs::read_optional(&path)? {
                    keys.insert(Record::decode(&bytes)?.key);
                }
            }
            Ok(keys)
        })
    }

    /// Atomically removes every record, keeping the metadata slot.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the new generation cannot be published; the
    /// store is then unchanged.
    pub fn clear_all(&self) -> StorageResult<()> {
        let builder = self.begin_generation()?;
        if let Some(metadata) = builder.previous_metadata()? {
            builder.put_metadata(&metadata)?;
        }
        let generation = builder.commit()?;
        tracing::info!(generation, "store cleared");
        Ok(())
    }

    /// Reads the reserved metadata slot (the sealed master key).
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` for I/O errors.
    pub fn read_metadata(&self) -> StorageResult<Option<Vec<u8>>> {
        self.with_stable_generation(|generation| {
            fs::read_optional(&self.paths.metadata_path(generation))
        })
    }

    /// Overwrites the metadata slot of the live generation.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the slot cannot be written.
    pub fn write_metadata(&self, bytes: &[u8]) -> StorageResult<()> {
        let _guard = self.lock.exclusive()?;
        let generation = self.current_generation()?;
        fs::write_atomic(&self.paths.metadata_path(generation), bytes)
    }

    /// Fills the metadata slot unless another writer got there first.
    ///
    /// Returns `None` when `bytes` were stored, or the existing contents when
    /// the slot was already taken.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the slot cannot be read or written.
    pub fn write_metadata_if_absent(&self, bytes: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let _guard = self.lock.exclusive()?;
        let path = self.paths.metadata_path(self.current_generation()?);
        if let Some(existing) = fs::read_optional(&path)? {
            return Ok(Some(existing));
        }
        fs::write_atomic(&path, bytes)?;
        Ok(None)
    }

    /// Publishes a generation holding exactly `metadata` and `records`.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the generation cannot be built or
    /// published; the store is then unchanged.
    pub fn commit_generation<I>(&self, metadata: Option<&[u8]>, records: I) -> StorageResult<u64>
    where
        I: IntoIterator<Item = Record>,
    {
        let builder = self.begin_generation()?;
        if let Some(metadata) = metadata {
            builder.put_metadata(metadata)?;
        }
        for record in records {
            builder.put_record(&record)?;
        }
        builder.commit()
    }

    /// Starts building a replacement generation.
    ///
    /// The builder holds the store lock exclusively until it is committed or
    /// dropped; dropping it without committing discards the new generation.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the generation directory cannot be created.
    pub fn begin_generation(&self) -> StorageResult<GenerationBuilder<'_>> {
        let guard = self.lock.exclusive()?;
        let previous = self.current_generation()?;
        let generation = previous.checked_add(1).ok_or_else(|| {
            StorageError::StorageFailure("generation counter exhausted".to_string())
        })?;
        let dir = self.paths.generation_dir(generation);
        if dir.exists() {
            remove_dir(&dir)?;
        }
        fs::create_dir_durable(&dir)?;
        Ok(GenerationBuilder {
            layer: self,
            guard,
            previous,
            generation,
            dir,
            committed: false,
        })
    }

    /// Runs `read` against the live generation until no commit interleaves.
    fn with_stable_generation<T>(
        &self,
        read: impl Fn(u64) -> StorageResult<T>,
    ) -> StorageResult<T> {
        for _ in 0..MAX_READ_ATTEMPTS {
            let generation = self.current_generation()?;
            let result = read(generation);
            if self.current_generation()? == generation {
                return result;
            }
            tracing::debug!(generation, "generation changed during read, retrying");
        }
        Err(StorageError::StorageFailure(
            "store kept changing during read".to_string(),
        ))
    }

    /// Removes unpublished generations and stray temp files.
    ///
    /// Requires the exclusive lock: no shared-lock writer may have a temp
    /// file in flight.
    fn collect_garbage(&self, current: u64, _guard: &StorageLockGuard) -> StorageResult<()> {
        let store_dir = self.paths.store_dir();
        for entry in read_dir(store_dir)? {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            match StoragePaths::parse_generation(&name) {
                Some(generation) if generation != current => {
                    remove_dir(&path)?;
                    tracing::debug!(generation, "removed stale generation");
                }
                None if StoragePaths::is_temp_file(&name) => {
                    fs::remove_optional(&path)?;
                }
                _ => {}
            }
        }
        for entry in read_dir(&self.paths.generation_dir(current))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if StoragePaths::is_temp_file(&name) {
                fs::remove_optional(&entry.path())?;
            }
        }
        Ok(())
    }
}

/// A generation under construction.
///
/// Created by [`PersistenceLayer::begin_generation`].
#[derive(Debug)]
pub struct GenerationBuilder<'a> {
    layer: &'a PersistenceLayer,
    guard: StorageLockGuard,
    previous: u64,
    generation: u64,
    dir: PathBuf,
    committed: bool,
}

impl GenerationBuilder<'_> {
    /// Number the new generation will carry.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Reads the metadata slot of the generation being replaced.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` for I/O errors.
    pub fn previous_metadata(&self) -> StorageResult<Option<Vec<u8>>> {
        fs::read_optional(&self.layer.paths.metadata_path(self.previous))
    }

    /// Calls `visit` with every record of the generation being replaced.
    ///
    /// # Errors
    ///
    /// Stops at the first error from decoding, I/O or `visit`.
    pub fn for_each_previous_record(
        &self,
        mut visit: impl FnMut(Record) -> StorageResult<()>,
    ) -> StorageResult<()> {
        for path in record_files(&self.layer.paths.generation_dir(self.previous))? {
            if let Some(bytes) = fs::read_optional(&path)? {
                visit(Record::decode(&bytes)?)?;
            }
        }
        Ok(())
    }

    /// Adds a record to the new generation.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the record cannot be written.
    pub fn put_record(&self, record: &Record) -> StorageResult<()> {
        fs::write_atomic(
            &self.layer.paths.record_path(self.generation, &record.id()),
            &record.encode()?,
        )
    }

    /// Sets the metadata slot of the new generation.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the slot cannot be written.
    pub fn put_metadata(&self, bytes: &[u8]) -> StorageResult<()> {
        fs::write_atomic(&self.layer.paths.metadata_path(self.generation), bytes)
    }

    /// Publishes the new generation and discards the old one.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the manifest cannot be replaced; the old
    /// generation then stays live. Cleanup failures after publishing are
    /// logged and retried on the next open.
    pub fn commit(mut self) -> StorageResult<u64> {
        self.publish()?;
        if let Err(err) = self.layer.collect_garbage(self.generation, &self.guard) {
            tracing::warn!(error = %err, "failed to clean up after commit");
        }
        Ok(self.generation)
    }

    fn publish(&mut self) -> StorageResult<()> {
        fs::sync_dir(&self.dir)?;
        Manifest::new(self.generation).publish(&self.layer.paths)?;
        self.committed = true;
        tracing::debug!(
            previous = self.previous,
            generation = self.generation,
            "generation published"
        );
        Ok(())
    }

    /// Simulates a crash after the new generation was fully built but before
    /// `CURRENT` was replaced.
    #[cfg(test)]
    pub(crate) fn crash_before_publish(mut self) {
        self.committed = true;
    }

    /// Simulates a crash right after `CURRENT` was replaced.
    #[cfg(test)]
    pub(crate) fn crash_after_publish(mut self) -> StorageResult<()> {
        self.publish()
    }
}

impl Drop for GenerationBuilder<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = remove_dir(&self.dir) {
                tracing::warn!(error = %err, generation = self.generation, "failed to discard generation");
            }
        }
    }
}

fn read_dir(dir: &Path) -> StorageResult<Vec<std::fs::DirEntry>> {
    std::fs::read_dir(dir)
        .and_then(Iterator::collect)
        .map_err(|err| StorageError::storage(format!("list '{}'", dir.display()), &err))
}

fn record_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = read_dir(dir)?
        .into_iter()
        .filter(|entry| StoragePaths::is_record_file(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();
    files.sort();
    Ok(files)
}

fn remove_dir(dir: &Path) -> StorageResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageError::storage(
            format!("remove '{}'", dir.display()),
            &err,
        )),
    }
}
