use std::collections::BTreeMap;

use crate::firestore::core::query::Query;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{FirestoreValue, MapValue};

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// True while the data may be behind the backend.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// True when the data includes local writes not yet acknowledged.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    data: Option<MapValue>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn new(key: DocumentKey, data: Option<MapValue>, metadata: SnapshotMetadata) -> Self {
        Self {
            key,
            data,
            metadata,
        }
    }

    pub(crate) fn from_document(document: &Document, metadata: SnapshotMetadata) -> Self {
        let data = document
            .is_found_document()
            .then(|| document.data().clone());
        Self::new(document.key().clone(), data, metadata)
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&BTreeMap<String, FirestoreValue>> {
        self.data.as_ref().map(|map| map.fields())
    }

    /// Value at `path`, if the document exists and has it.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.as_ref().and_then(|map| map.field(path))
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub change_type: ChangeType,
    pub document: DocumentSnapshot,
}

/// Results of a query at one point in time, with what changed since the last one.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    documents: Vec<DocumentSnapshot>,
    changes: Vec<DocumentChange>,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub fn from_view_snapshot(snapshot: ViewSnapshot) -> Self {
        let from_cache = snapshot.from_cache;
        let document_metadata = |document: &Document| {
            SnapshotMetadata::new(from_cache, snapshot.mutated_keys.contains(document.key()))
        };
        let documents = snapshot
            .documents
            .iter()
            .map(|document| DocumentSnapshot::from_document(document, document_metadata(document)))
            .collect();
        let changes = snapshot
            .document_changes
            .iter()
            .map(|change| DocumentChange {
                change_type: change.change_type,
                document: DocumentSnapshot::from_document(&change.document, document_metadata(&change.document)),
            })
            .collect();
        Self {
            metadata: SnapshotMetadata::new(from_cache, snapshot.has_pending_writes()),
            query: (*snapshot.query).clone(),
            documents,
            changes,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    /// Changes since the previous snapshot; every document for the first one.
    pub fn document_changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn into_documents(self) -> Vec<DocumentSnapshot> {
        self.documents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::document_set::DocumentSet;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn metadata_flags() {
        let meta = SnapshotMetadata::new(true, false);
        assert!(meta.from_cache());
        assert!(!meta.has_pending_writes());
    }

    #[test]
    fn missing_document_does_not_exist() {
        let key = DocumentKey::from_string("drinks/espresso").unwrap();
        let deleted = Document::new_no_document(key, SnapshotVersion::new(Timestamp::new(1, 0)));
        let snapshot = DocumentSnapshot::from_document(&deleted, SnapshotMetadata::default());
        assert!(!snapshot.exists());
        assert_eq!(snapshot.id(), "espresso");
    }

    #[test]
    fn per_document_pending_writes_follow_mutated_keys() {
        let query = Arc::new(Query::collection("drinks").unwrap());
        let mut documents = DocumentSet::new(Arc::clone(&query));
        let local = DocumentKey::from_string("drinks/latte").unwrap();
        let synced = DocumentKey::from_string("drinks/mocha").unwrap();
        for key in [&local, &synced] {
            documents.insert(Document::new_found_document(
                key.clone(),
                SnapshotVersion::new(Timestamp::new(1, 0)),
                MapValue::empty(),
            ));
        }
        let view_snapshot = ViewSnapshot::from_initial_documents(
            query,
            documents,
            BTreeSet::from([local.clone()]),
            true,
            false,
        );

        let snapshot = QuerySnapshot::from_view_snapshot(view_snapshot);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.metadata().has_pending_writes());
        assert!(snapshot.documents()[0].has_pending_writes());
        assert!(!snapshot.documents()[1].has_pending_writes());
        assert!(snapshot.documents().iter().all(DocumentSnapshot::from_cache));
        assert_eq!(snapshot.document_changes().len(), 2);
    }
}
