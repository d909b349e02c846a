use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// Aggregated result of a consistent batch of watch changes.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    /// Version at which every target in the event was consistent; `min` for events
    /// that only carry target resets or limbo results.
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter disagreed with the cache and must re-listen.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Limbo documents that no non-limbo target mentioned.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target membership and metadata delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Bytes,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
