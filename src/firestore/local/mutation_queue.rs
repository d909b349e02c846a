use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::firestore::credentials::User;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::table::{JournaledTable, Table};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, ResourcePath, Timestamp, BATCH_ID_UNKNOWN,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MutationQueueMetadata {
    pub last_acknowledged_batch_id: BatchId,
    pub highest_batch_id: BatchId,
    #[serde(with = "crate::firestore::local::local_serializer::base64_bytes")]
    pub last_stream_token: Bytes,
}

impl Default for MutationQueueMetadata {
    fn default() -> Self {
        Self {
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            highest_batch_id: BATCH_ID_UNKNOWN,
            last_stream_token: Bytes::new(),
        }
    }
}

/// Pending mutation batches, one ordered queue per user.
///
/// Batch ids are allocated from a counter shared by every user so they never repeat,
/// even after acknowledged batches are removed.
pub struct MutationQueue {
    user: String,
    mutations: Table<(String, BatchId), MutationBatch>,
    document_mutations: Table<(String, DocumentKey, BatchId), ()>,
    metadata: Table<String, MutationQueueMetadata>,
}

impl MutationQueue {
    pub(crate) fn new() -> Self {
        Self {
            user: String::new(),
            mutations: Table::new("mutations"),
            document_mutations: Table::new("document_mutations"),
            metadata: Table::new("mutation_queue_metadata"),
        }
    }

    pub(crate) fn set_user(&mut self, user: &User) {
        self.user = user.storage_key();
    }

    fn current_metadata(&self) -> MutationQueueMetadata {
        self.metadata.get(&self.user).cloned().unwrap_or_default()
    }

    fn next_batch_id(&self) -> BatchId {
        let highest = self
            .metadata
            .iter()
            .map(|(_, metadata)| metadata.highest_batch_id)
            .max()
            .unwrap_or(BATCH_ID_UNKNOWN);
        highest.max(0) + 1
    }

    fn user_batches(&self) -> impl Iterator<Item = &MutationBatch> {
        let user = self.user.clone();
        self.mutations
            .range((user.clone(), BatchId::MIN)..)
            .take_while(move |((owner, _), _)| *owner == user)
            .map(|(_, batch)| batch)
    }

    pub fn is_empty(&self) -> bool {
        self.user_batches().next().is_none()
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.next_batch_id();
        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        for key in batch.keys() {
            self.document_mutations
                .insert((self.user.clone(), key, batch_id), ());
        }
        self.mutations
            .insert((self.user.clone(), batch_id), batch.clone());
        let mut metadata = self.current_metadata();
        metadata.highest_batch_id = batch_id;
        self.metadata.insert(self.user.clone(), metadata);
        batch
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.mutations.get(&(self.user.clone(), batch_id)).cloned()
    }

    /// First batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.user_batches()
            .find(|batch| batch.batch_id > batch_id)
            .cloned()
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.user_batches()
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.user_batches().cloned().collect()
    }

    pub fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.batch_ids_for_key(key)
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    /// Batches touching any of `keys`, in batch order.
    pub fn all_mutation_batches_affecting_document_keys<'a, I>(&self, keys: I) -> Vec<MutationBatch>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let ids: BTreeSet<BatchId> = keys
            .into_iter()
            .flat_map(|key| self.batch_ids_for_key(key))
            .collect();
        ids.into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    /// Batches touching documents directly inside `collection`.
    pub fn all_mutation_batches_affecting_collection(&self, collection: &ResourcePath) -> Vec<MutationBatch> {
        let start = (
            self.user.clone(),
            DocumentKey::collection_scan_start(collection),
            BatchId::MIN,
        );
        let ids: BTreeSet<BatchId> = self
            .document_mutations
            .range(start..)
            .take_while(|((owner, key, _), _)| *owner == self.user && collection.is_prefix_of(key.path()))
            .filter(|((_, key, _), _)| collection.is_immediate_parent_of(key.path()))
            .map(|((_, _, batch_id), _)| *batch_id)
            .collect();
        ids.into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> Vec<BatchId> {
        self.document_mutations
            .range((self.user.clone(), key.clone(), BatchId::MIN)..)
            .take_while(|((owner, candidate, _), _)| *owner == self.user && candidate == key)
            .map(|((_, _, batch_id), _)| *batch_id)
            .collect()
    }

    /// Removes `batch`, which must be the oldest batch in the queue.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        let oldest = self.user_batches().next().map(|batch| batch.batch_id);
        if oldest != Some(batch.batch_id) {
            return Err(internal_error(format!(
                "Can only remove the first entry of the mutation queue (removing {}, oldest is {:?})",
                batch.batch_id, oldest
            )));
        }
        self.mutations.remove(&(self.user.clone(), batch.batch_id));
        for key in batch.keys() {
            self.document_mutations
                .remove(&(self.user.clone(), key, batch.batch_id));
        }
        Ok(())
    }

    pub fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Bytes) -> FirestoreResult<()> {
        let mut metadata = self.current_metadata();
        if batch.batch_id <= metadata.last_acknowledged_batch_id {
            return Err(internal_error(format!(
                "Batch {} was already acknowledged (last acknowledged {})",
                batch.batch_id, metadata.last_acknowledged_batch_id
            )));
        }
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = stream_token;
        self.metadata.insert(self.user.clone(), metadata);
        Ok(())
    }

    pub fn last_stream_token(&self) -> Bytes {
        self.current_metadata().last_stream_token
    }

    pub fn set_last_stream_token(&mut self, stream_token: Bytes) {
        let mut metadata = self.current_metadata();
        metadata.last_stream_token = stream_token;
        self.metadata.insert(self.user.clone(), metadata);
    }

    /// Whether any user's queue still writes `key`.
    pub(crate) fn contains_key_for_any_user(&self, key: &DocumentKey) -> bool {
        self.metadata.iter().any(|(user, _)| {
            self.document_mutations
                .range((user.clone(), key.clone(), BatchId::MIN)..)
                .next()
                .map(|((owner, candidate, _), _)| owner == user && candidate == key)
                .unwrap_or(false)
        })
    }

    pub(crate) fn tables_mut(&mut self) -> [&mut dyn JournaledTable; 3] {
        [
            &mut self.mutations,
            &mut self.document_mutations,
            &mut self.metadata,
        ]
    }
}
