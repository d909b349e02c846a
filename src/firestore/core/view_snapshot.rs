use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the document's pending-write state changed.
    Metadata,
}

impl ChangeType {
    /// Removals are reported first, then additions, then modifications.
    pub(crate) fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Collapses successive changes to the same document into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some((new_type, change.document)),
            (old_type, Metadata) if old_type != Removed => Some((old_type, change.document)),
            (Modified, Modified) => Some((Modified, change.document)),
            (Added, Modified) => Some((Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some((Removed, old.document.clone())),
            (Removed, Added) => Some((Modified, change.document)),
            (old_type, new_type) => {
                log::error!("firestore: unsupported change {new_type:?} after {old_type:?} for {key}");
                Some((new_type, change.document))
            }
        };
        match merged {
            Some((change_type, document)) => {
                self.changes.insert(
                    key,
                    DocumentViewChange {
                        change_type,
                        document,
                    },
                );
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// One state of a query's results, plus how it differs from the previous one.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Arc<Query>,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    /// Keys of documents in the result with writes not yet acknowledged.
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// True until the results are known to be consistent with the backend.
    pub from_cache: bool,
    pub sync_state_changed: bool,
    /// Metadata-only changes were filtered out of `document_changes`.
    pub excludes_metadata_changes: bool,
    /// The target had a resume token, i.e. results were seen before.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A snapshot presenting every document as newly added.
    pub fn from_initial_documents(
        query: Arc<Query>,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        Self {
            old_documents: DocumentSet::new(Arc::clone(&query)),
            query,
            documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// The same snapshot without per-document metadata changes.
    pub fn without_metadata_changes(mut self) -> Self {
        self.document_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        self.excludes_metadata_changes = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn change(change_type: ChangeType, path: &str, seconds: i64) -> DocumentViewChange {
        DocumentViewChange {
            change_type,
            document: Document::new_found_document(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::new(Timestamp::new(seconds, 0)),
                MapValue::empty(),
            ),
        }
    }

    #[test]
    fn successive_changes_collapse() {
        let mut set = DocumentChangeSet::default();
        set.track(change(ChangeType::Added, "rooms/a", 1));
        set.track(change(ChangeType::Modified, "rooms/a", 2));
        set.track(change(ChangeType::Removed, "rooms/b", 1));
        set.track(change(ChangeType::Added, "rooms/b", 3));
        set.track(change(ChangeType::Added, "rooms/c", 1));
        set.track(change(ChangeType::Removed, "rooms/c", 1));

        let changes = set.into_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].document.version(), SnapshotVersion::new(Timestamp::new(2, 0)));
        assert_eq!(changes[1].change_type, ChangeType::Modified);
    }

    #[test]
    fn metadata_change_keeps_the_stronger_type() {
        let mut set = DocumentChangeSet::default();
        set.track(change(ChangeType::Modified, "rooms/a", 1));
        set.track(change(ChangeType::Metadata, "rooms/a", 2));
        let changes = set.into_changes();
        assert_eq!(changes[0].change_type, ChangeType::Modified);
    }
}
