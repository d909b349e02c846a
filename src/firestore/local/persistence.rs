use crate::firestore::credentials::User;
use crate::firestore::error::{persistence_unavailable, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::storage::{
    FileStorageBackend, MemoryStorageBackend, StorageBackend, StorageBatch, StorageImage,
};
use crate::firestore::local::table::JournaledTable;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::settings::PersistenceMode;

/// Every persisted table, grouped by the cache that owns it.
pub struct PersistedState {
    pub mutation_queue: MutationQueue,
    pub remote_documents: RemoteDocumentCache,
    pub document_overlays: DocumentOverlayCache,
    pub target_cache: TargetCache,
}

impl PersistedState {
    fn new() -> Self {
        Self {
            mutation_queue: MutationQueue::new(),
            remote_documents: RemoteDocumentCache::new(),
            document_overlays: DocumentOverlayCache::new(),
            target_cache: TargetCache::new(),
        }
    }

    pub(crate) fn set_user(&mut self, user: &User) {
        self.mutation_queue.set_user(user);
        self.document_overlays.set_user(user);
    }

    fn tables_mut(&mut self) -> Vec<&mut dyn JournaledTable> {
        let mut tables: Vec<&mut dyn JournaledTable> = Vec::new();
        tables.extend(self.mutation_queue.tables_mut());
        tables.extend(self.remote_documents.tables_mut());
        tables.extend(self.document_overlays.tables_mut());
        tables.extend(self.target_cache.tables_mut());
        tables
    }

    fn load(&mut self, image: &StorageImage) -> FirestoreResult<()> {
        for table in self.tables_mut() {
            if let Some(rows) = image.get(table.name()) {
                table.load(rows)?;
            }
        }
        Ok(())
    }
}

/// Owns the persisted state and the storage backend beneath it.
///
/// All mutation happens through [`Persistence::run_transaction`]: the closure's writes
/// are committed to the backend as one batch, and every table is rolled back if the
/// closure or the commit fails.
pub struct Persistence {
    state: PersistedState,
    backend: Box<dyn StorageBackend>,
    started: bool,
}

impl Persistence {
    /// Opens the configured storage, degrading to memory-only when it is unusable.
    pub fn open(mode: &PersistenceMode, user: &User) -> Self {
        let backend: Box<dyn StorageBackend> = match mode {
            PersistenceMode::Memory => Box::new(MemoryStorageBackend),
            PersistenceMode::File(path) => match FileStorageBackend::open(path) {
                Ok(backend) => Box::new(backend),
                Err(err) => {
                    log::warn!(
                        "firestore: durable cache unavailable ({err}); continuing memory-only"
                    );
                    Box::new(MemoryStorageBackend)
                }
            },
        };
        match Self::with_backend(backend, user) {
            Ok(persistence) => persistence,
            Err(err) => {
                log::warn!("firestore: failed to load cache ({err}); continuing memory-only");
                Self::memory(user)
            }
        }
    }

    pub fn memory(user: &User) -> Self {
        let mut state = PersistedState::new();
        state.set_user(user);
        Self {
            state,
            backend: Box::new(MemoryStorageBackend),
            started: true,
        }
    }

    pub fn with_backend(mut backend: Box<dyn StorageBackend>, user: &User) -> FirestoreResult<Self> {
        let image = backend.load()?;
        let mut state = PersistedState::new();
        state.load(&image)?;
        state.set_user(user);
        Ok(Self {
            state,
            backend,
            started: true,
        })
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Read access outside a transaction.
    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub(crate) fn set_user(&mut self, user: &User) {
        self.state.set_user(user);
    }

    pub fn run_transaction<T, F>(&mut self, action: &str, operation: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistedState) -> FirestoreResult<T>,
    {
        if !self.started {
            return Err(persistence_unavailable(format!(
                "cannot run '{action}': persistence has been shut down"
            )));
        }
        for table in self.state.tables_mut() {
            table.begin();
        }

        let result = operation(&mut self.state).and_then(|value| {
            let mut batch = StorageBatch::default();
            for table in self.state.tables_mut() {
                batch.writes.extend(table.pending_writes()?);
            }
            self.backend.commit(&batch)?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                for table in self.state.tables_mut() {
                    table.end();
                }
                Ok(value)
            }
            Err(err) => {
                log::warn!("firestore: transaction '{action}' failed: {err}");
                for table in self.state.tables_mut() {
                    table.rollback();
                }
                self.state
                    .remote_documents
                    .index_manager_mut()
                    .invalidate_field_indexes();
                Err(err)
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{internal_error, FirestoreErrorCode};
    use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};
    use crate::firestore::value::MapValue;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingBackend {
        image: Arc<Mutex<StorageImage>>,
        fail_commits: Arc<Mutex<bool>>,
    }

    impl StorageBackend for RecordingBackend {
        fn load(&mut self) -> FirestoreResult<StorageImage> {
            Ok(self.image.lock().unwrap().clone())
        }

        fn commit(&mut self, batch: &StorageBatch) -> FirestoreResult<()> {
            if *self.fail_commits.lock().unwrap() {
                return Err(persistence_unavailable("disk full"));
            }
            let mut image = self.image.lock().unwrap();
            for write in &batch.writes {
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
            Ok(())
        }

        fn is_durable(&self) -> bool {
            true
        }
    }

    fn doc(path: &str) -> Document {
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            MapValue::empty(),
        )
    }

    #[test]
    fn committed_state_survives_reopen() {
        let backend = RecordingBackend::default();
        let user = User::unauthenticated();
        let mut persistence = Persistence::with_backend(Box::new(backend.clone()), &user).unwrap();
        persistence
            .run_transaction("add", |state| {
                state.remote_documents.add_entry(&doc("rooms/a"), SnapshotVersion::min());
                Ok(())
            })
            .unwrap();

        let reopened = Persistence::with_backend(Box::new(backend), &user).unwrap();
        assert!(reopened
            .state()
            .remote_documents
            .contains(&DocumentKey::from_string("rooms/a").unwrap()));
    }

    #[test]
    fn failed_operation_rolls_back() {
        let mut persistence = Persistence::memory(&User::unauthenticated());
        let result: FirestoreResult<()> = persistence.run_transaction("boom", |state| {
            state.remote_documents.add_entry(&doc("rooms/a"), SnapshotVersion::min());
            Err(internal_error("boom"))
        });
        assert!(result.is_err());
        assert!(persistence.state().remote_documents.is_empty());
    }

    #[test]
    fn failed_commit_rolls_back() {
        let backend = RecordingBackend::default();
        *backend.fail_commits.lock().unwrap() = true;
        let mut persistence =
            Persistence::with_backend(Box::new(backend), &User::unauthenticated()).unwrap();
        let err = persistence
            .run_transaction("add", |state| {
                state.remote_documents.add_entry(&doc("rooms/a"), SnapshotVersion::min());
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PersistenceUnavailable);
        assert!(persistence.state().remote_documents.is_empty());
    }

    #[test]
    fn shut_down_persistence_rejects_transactions() {
        let mut persistence = Persistence::memory(&User::unauthenticated());
        persistence.shutdown();
        let err = persistence.run_transaction("noop", |_| Ok(())).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PersistenceUnavailable);
    }

    #[test]
    fn unusable_file_falls_back_to_memory() {
        let mut path = std::env::temp_dir();
        path.push(format!("firestore-offline-sync-dir-{}", rand::random::<u32>()));
        std::fs::create_dir_all(&path).unwrap();
        // A directory cannot be read as a cache file.
        let persistence = Persistence::open(&PersistenceMode::File(path.clone()), &User::unauthenticated());
        assert!(!persistence.is_durable());
        let _ = std::fs::remove_dir_all(&path);
    }
}
