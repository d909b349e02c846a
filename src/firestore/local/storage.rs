use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;

use crate::firestore::error::{persistence_unavailable, FirestoreResult};

/// Table name -> encoded key -> row.
pub type StorageImage = BTreeMap<String, BTreeMap<String, JsonValue>>;

/// One row change; `value == None` deletes the row.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageWrite {
    pub table: &'static str,
    pub key: String,
    pub value: Option<JsonValue>,
}

/// The writes of one committed transaction, applied atomically.
#[derive(Clone, Debug, Default)]
pub struct StorageBatch {
    pub writes: Vec<StorageWrite>,
}

impl StorageBatch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn apply_to(&self, image: &mut StorageImage) {
        for write in &self.writes {
            let rows = image.entry(write.table.to_string()).or_default();
            match &write.value {
                Some(value) => {
                    rows.insert(write.key.clone(), value.clone());
                }
                None => {
                    rows.remove(&write.key);
                }
            }
        }
    }
}

/// Durable key-value storage underneath the persistence tables.
pub trait StorageBackend: Send {
    fn load(&mut self) -> FirestoreResult<StorageImage>;

    fn commit(&mut self, batch: &StorageBatch) -> FirestoreResult<()>;

    fn is_durable(&self) -> bool;
}

/// Keeps nothing beyond the process lifetime.
#[derive(Debug, Default)]
pub struct MemoryStorageBackend;

impl StorageBackend for MemoryStorageBackend {
    fn load(&mut self) -> FirestoreResult<StorageImage> {
        Ok(StorageImage::new())
    }

    fn commit(&mut self, _batch: &StorageBatch) -> FirestoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Stores the whole image as one JSON file, replaced atomically on every commit.
///
/// Each non-empty commit clones the in-memory image and re-encodes all of it, so a
/// write costs time and I/O proportional to the total cache size rather than to the
/// size of the batch. Read-only transactions commit an empty batch and skip the file.
#[derive(Debug)]
pub struct FileStorageBackend {
    path: PathBuf,
    image: StorageImage,
}

impl FileStorageBackend {
    pub fn open(path: impl Into<PathBuf>) -> FirestoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                persistence_unavailable(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        let image = read_image(&path)?;
        let mut backend = Self { path, image };
        // Probe writability up front so an unusable location fails at open time.
        backend.flush()?;
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&mut self) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(&self.image)
            .map_err(|err| persistence_unavailable(format!("cannot encode cache image: {err}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload)
            .map_err(|err| persistence_unavailable(format!("cannot write {}: {err}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|err| {
            persistence_unavailable(format!("cannot replace {}: {err}", self.path.display()))
        })
    }
}

fn read_image(path: &Path) -> FirestoreResult<StorageImage> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(StorageImage::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            persistence_unavailable(format!("corrupt cache file {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(StorageImage::new()),
        Err(err) => Err(persistence_unavailable(format!(
            "cannot read {}: {err}",
            path.display()
        ))),
    }
}

impl StorageBackend for FileStorageBackend {
    fn load(&mut self) -> FirestoreResult<StorageImage> {
        Ok(self.image.clone())
    }

    fn commit(&mut self, batch: &StorageBatch) -> FirestoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let previous = self.image.clone();
        batch.apply_to(&mut self.image);
        if let Err(err) = self.flush() {
            self.image = previous;
            return Err(err);
        }
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}
