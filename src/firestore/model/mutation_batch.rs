use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, FieldMask, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

/// Mutations written together, applied and acknowledged as a unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    pub fn touches(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|m| m.key() == key)
    }

    /// Replays this batch's mutations for `document` onto its local view.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.mutations.iter() {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the acknowledged results of this batch to `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut Document,
        result: &MutationBatchResult,
    ) {
        for (mutation, mutation_result) in self.mutations.iter().zip(result.mutation_results.iter()) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }
}

/// Backend acknowledgement for a [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Bytes,
    /// Version each written document had after the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    #[test]
    fn result_requires_one_entry_per_mutation() {
        let key = DocumentKey::from_string("a/b").unwrap();
        let batch = MutationBatch::new(1, Timestamp::now(), vec![Mutation::delete(key.clone())]);
        let err = MutationBatchResult::from(batch.clone(), SnapshotVersion::min(), vec![], Bytes::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");

        let version = SnapshotVersion::new(Timestamp::new(3, 0));
        let result = MutationBatchResult::from(
            batch,
            version,
            vec![MutationResult::new(version, vec![])],
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(result.doc_versions.get(&key), Some(&version));
    }

    #[test]
    fn local_view_only_applies_mutations_for_the_document() {
        let a = DocumentKey::from_string("c/a").unwrap();
        let b = DocumentKey::from_string("c/b").unwrap();
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![Mutation::set(a.clone(), MapValue::empty()), Mutation::delete(b)],
        );
        let mut doc = Document::new_invalid_document(a);
        batch.apply_to_local_view(&mut doc, Some(FieldMask::empty()));
        assert!(doc.is_found_document());
    }
}
