use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Placeholder for a key the cache knows nothing about.
    Invalid,
    FoundDocument,
    NoDocument,
    /// A committed write whose resulting state is not known locally.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A cached document and its synchronization metadata.
///
/// State only changes through the `convert_to_*` and `set_*` transitions; the caches
/// hand out clones so callers never share a mutable copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

impl Document {
    fn new(
        key: DocumentKey,
        document_type: DocumentType,
        version: SnapshotVersion,
        data: MapValue,
        state: DocumentState,
    ) -> Self {
        Self {
            key,
            document_type,
            version,
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data,
            document_state: state,
        }
    }

    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self::new(
            key,
            DocumentType::Invalid,
            SnapshotVersion::min(),
            MapValue::empty(),
            DocumentState::Synced,
        )
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self::new(key, DocumentType::FoundDocument, version, data, DocumentState::Synced)
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new(
            key,
            DocumentType::NoDocument,
            version,
            MapValue::empty(),
            DocumentState::Synced,
        )
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new(
            key,
            DocumentType::UnknownDocument,
            version,
            MapValue::empty(),
            DocumentState::HasCommittedMutations,
        )
    }

    pub fn convert_to_found_document(
        &mut self,
        version: SnapshotVersion,
        data: MapValue,
    ) -> &mut Self {
        if self.create_time.is_min()
            && (self.document_type == DocumentType::NoDocument
                || self.document_type == DocumentType::Invalid)
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: SnapshotVersion) -> &mut Self {
        self.create_time = create_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub(crate) fn estimated_byte_size(&self) -> usize {
        self.key.path().canonical_string().len() + self.data.estimated_byte_size()
    }
}
