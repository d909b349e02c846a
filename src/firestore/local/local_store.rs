//! Local store: the single entry point to cached and pending state.
//!
//! Every operation runs as one persistence transaction. Callers are expected to be
//! serialized by the client's operation queue.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::firestore::core::query::{Query, Target};
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::credentials::User;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::local_documents_view;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::persistence::{PersistedState, Persistence};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, ListenSequenceNumber, Mutation,
    MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, Timestamp,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};

/// Target metadata is rewritten at least this often (in snapshot time) even when
/// membership did not change, so a restart resumes from a recent token.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, Document>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Documents a view started or stopped showing after computing a snapshot.
#[derive(Clone, Debug, Default)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: BTreeMap<DocumentKey, Document>,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

pub struct LocalStore {
    persistence: Persistence,
    query_engine: QueryEngine,
    garbage_collector: LruGarbageCollector,
    target_id_generator: TargetIdGenerator,
    /// Targets with at least one local listener.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, TargetId>,
    local_view_references: ReferenceSet,
    limbo_references: ReferenceSet,
    user: User,
}

impl LocalStore {
    pub fn new(mut persistence: Persistence, query_engine: QueryEngine, lru_params: LruParams, user: User) -> Self {
        let highest_target_id = persistence.state().target_cache.highest_target_id();
        persistence.set_user(&user);
        Self {
            persistence,
            query_engine,
            garbage_collector: LruGarbageCollector::new(lru_params),
            target_id_generator: TargetIdGenerator::for_target_cache(highest_target_id),
            target_data_by_target: BTreeMap::new(),
            target_ids_by_canonical_id: BTreeMap::new(),
            local_view_references: ReferenceSet::new(),
            limbo_references: ReferenceSet::new(),
            user,
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn is_durable(&self) -> bool {
        self.persistence.is_durable()
    }

    pub fn set_auto_index_creation(&mut self, enabled: bool) {
        self.query_engine.set_auto_index_creation(enabled);
    }

    /// Rebinds the mutation queue and overlays to `user`.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_batches = self.persistence.state().mutation_queue.all_mutation_batches();
        self.persistence.set_user(&user);
        self.user = user;

        self.persistence.run_transaction("Handle user change", |state| {
            let new_batches = state.mutation_queue.all_mutation_batches();
            let mut changed_keys = BTreeSet::new();
            for batch in old_batches.iter().chain(new_batches.iter()) {
                changed_keys.extend(batch.keys());
            }
            Ok(UserChangeResult {
                affected_documents: local_documents_view::get_documents(state, &changed_keys),
                removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
            })
        })
    }

    /// Queues `mutations` as a new batch and folds it into the affected overlays.
    pub fn local_write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();

        self.persistence.run_transaction("Locally write mutations", |state| {
            let remote = state.remote_documents.get_entries(&keys);
            let overlayed = local_documents_view::get_overlayed_documents(state, remote, &BTreeSet::new());
            let batch = state.mutation_queue.add_mutation_batch(local_write_time, mutations);

            let mut overlays = BTreeMap::new();
            let mut changes = BTreeMap::new();
            for (key, overlayed_document) in overlayed {
                let mut document = overlayed_document.document;
                let mask = batch.apply_to_local_view(&mut document, overlayed_document.mutated_fields);
                overlays.insert(key.clone(), calculate_overlay_mutation(&document, mask.as_ref()));
                changes.insert(key, document);
            }
            state.document_overlays.save_overlays(batch.batch_id, overlays);

            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes,
            })
        })
    }

    /// Applies an acknowledged batch to the remote documents and drops it from the queue.
    pub fn acknowledge_batch(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        self.persistence.run_transaction("Acknowledge batch", |state| {
            let batch = &batch_result.batch;
            let affected = batch.keys();
            state
                .mutation_queue
                .acknowledge_batch(batch, batch_result.stream_token.clone())?;

            for key in &affected {
                let mut document = state.remote_documents.get_entry(key);
                let Some(ack_version) = batch_result.doc_versions.get(key) else {
                    return Err(internal_error(format!("missing acknowledged version for {key}")));
                };
                if document.version() < *ack_version {
                    batch.apply_to_remote_document(&mut document, batch_result);
                    if document.is_valid_document() {
                        document.set_read_time(batch_result.commit_version);
                        state
                            .remote_documents
                            .add_entry(&document, batch_result.commit_version);
                    }
                }
            }
            state.mutation_queue.remove_mutation_batch(batch)?;
            finish_batch_removal(state, batch, &affected);
            Ok(local_documents_view::get_documents(state, &affected))
        })
    }

    /// Drops a batch the backend rejected.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        self.persistence.run_transaction("Reject batch", |state| {
            let batch = state
                .mutation_queue
                .lookup_mutation_batch(batch_id)
                .ok_or_else(|| internal_error(format!("attempt to reject nonexistent batch {batch_id}")))?;
            let affected = batch.keys();
            state.mutation_queue.remove_mutation_batch(&batch)?;
            finish_batch_removal(state, &batch, &affected);
            Ok(local_documents_view::get_documents(state, &affected))
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.persistence
            .state()
            .mutation_queue
            .highest_unacknowledged_batch_id()
    }

    /// First pending batch after `after_batch_id` (`BATCH_ID_UNKNOWN` for the oldest).
    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> Option<MutationBatch> {
        self.persistence
            .state()
            .mutation_queue
            .next_mutation_batch_after_batch_id(after_batch_id)
    }

    pub fn last_stream_token(&self) -> Bytes {
        self.persistence.state().mutation_queue.last_stream_token()
    }

    pub fn set_last_stream_token(&mut self, stream_token: Bytes) -> FirestoreResult<()> {
        self.persistence.run_transaction("Set last stream token", |state| {
            state.mutation_queue.set_last_stream_token(stream_token);
            Ok(())
        })
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.persistence
            .state()
            .target_cache
            .last_remote_snapshot_version()
    }

    /// Absorbs a consistent watch event; returns the new local views of changed documents.
    pub fn apply_remote_event(&mut self, remote_event: &RemoteEvent) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let remote_version = remote_event.snapshot_version;
        let mut updated_targets = self.target_data_by_target.clone();

        let changes = self.persistence.run_transaction("Apply remote event", |state| {
            let sequence_number = state.target_cache.next_sequence_number();

            for (target_id, change) in &remote_event.target_changes {
                let Some(old_target_data) = updated_targets.get(target_id).cloned() else {
                    continue;
                };
                state
                    .target_cache
                    .remove_matching_keys(&change.removed_documents, *target_id, sequence_number);
                state
                    .target_cache
                    .add_matching_keys(&change.added_documents, *target_id, sequence_number);

                let mut new_target_data = old_target_data.with_sequence_number(sequence_number);
                if remote_event.target_mismatches.contains_key(target_id) {
                    new_target_data = new_target_data
                        .with_resume_token(Bytes::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    if remote_version < old_target_data.snapshot_version {
                        log::debug!(
                            "firestore: ignoring resume token for target {target_id} at {remote_version}, target is at {}",
                            old_target_data.snapshot_version
                        );
                    } else {
                        new_target_data =
                            new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                }

                if should_persist_target_data(&old_target_data, &new_target_data, change) {
                    state.target_cache.update_target_data(&new_target_data);
                }
                updated_targets.insert(*target_id, new_target_data);
            }

            for key in remote_event.document_updates.keys() {
                if remote_event.resolved_limbo_documents.contains(key) {
                    state
                        .target_cache
                        .update_document_sequence_number(key, sequence_number);
                }
            }

            let (changed, existence_changed) =
                populate_document_changes(state, &remote_event.document_updates, remote_version);

            if !remote_version.is_min() {
                let last_remote_version = state.target_cache.last_remote_snapshot_version();
                if remote_version < last_remote_version {
                    return Err(internal_error(format!(
                        "watch stream reverted to previous snapshot ({remote_version} < {last_remote_version})"
                    )));
                }
                state.target_cache.set_target_snapshot_version(remote_version);
            }

            let views = local_documents_view::get_overlayed_documents(state, changed, &existence_changed);
            Ok(views
                .into_iter()
                .map(|(key, overlayed)| (key, overlayed.document))
                .collect())
        })?;

        self.target_data_by_target = updated_targets;
        Ok(changes)
    }

    /// Returns cached target data for `target`, creating and persisting it on first use.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let generator = &mut self.target_id_generator;
        let target_data = self.persistence.run_transaction("Allocate target", |state| {
            if let Some(cached) = state.target_cache.get_target_data(&target) {
                return Ok(cached);
            }
            let sequence_number = state.target_cache.next_sequence_number();
            let target_data = TargetData::new(
                target.clone(),
                generator.next(),
                TargetPurpose::Listen,
                sequence_number,
            );
            state.target_cache.add_target_data(&target_data);
            Ok(target_data)
        })?;

        let replace = match self.target_data_by_target.get(&target_data.target_id) {
            Some(existing) => target_data.snapshot_version > existing.snapshot_version,
            None => true,
        };
        if replace {
            self.target_ids_by_canonical_id
                .insert(target.canonical_id(), target_data.target_id);
            self.target_data_by_target
                .insert(target_data.target_id, target_data.clone());
        }
        Ok(target_data)
    }

    /// Stops tracking an active target. Its cached data stays for the garbage collector.
    pub fn release_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_target.get(&target_id).cloned() else {
            return Err(internal_error(format!("tried to release nonexistent target {target_id}")));
        };
        let released = self.local_view_references.references_for_id(target_id);

        self.persistence.run_transaction("Release target", |state| {
            let sequence_number = state.target_cache.next_sequence_number();
            for key in &released {
                state
                    .target_cache
                    .update_document_sequence_number(key, sequence_number);
            }
            state
                .target_cache
                .update_target_data(&target_data.with_sequence_number(sequence_number));
            Ok(())
        })?;

        self.local_view_references.remove_references_for_id(target_id);
        self.target_data_by_target.remove(&target_id);
        self.target_ids_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Active or cached target data for `target`.
    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
            .cloned()
            .or_else(|| self.persistence.state().target_cache.get_target_data(target))
    }

    /// Target data for an active target.
    pub fn get_active_target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    pub fn get_remote_document_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.persistence
            .state()
            .target_cache
            .get_matching_keys_for_target_id(target_id)
    }

    /// Runs `query` against the cache, optionally re-using the target's previous results.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target());
        let (last_limbo_free, remote_keys) = match &target_data {
            Some(data) => (
                data.last_limbo_free_snapshot_version,
                self.get_remote_document_keys(data.target_id),
            ),
            None => (SnapshotVersion::min(), BTreeSet::new()),
        };
        let engine = &self.query_engine;
        self.persistence.run_transaction("Execute query", |state| {
            let documents = if use_previous_results {
                engine.get_documents_matching_query(state, query, last_limbo_free, &remote_keys)
            } else {
                engine.get_documents_matching_query(state, query, SnapshotVersion::min(), &BTreeSet::new())
            };
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    /// Records which documents views show, and advances limbo-free versions.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let targets = &self.target_data_by_target;
        let limbo_free = self.persistence.run_transaction("Notify local view changes", |state| {
            let sequence_number = state.target_cache.next_sequence_number();
            let mut limbo_free = Vec::new();
            for change in view_changes {
                for key in &change.removed_keys {
                    state
                        .target_cache
                        .update_document_sequence_number(key, sequence_number);
                }
                if !change.from_cache {
                    if let Some(target_data) = targets.get(&change.target_id) {
                        let updated = target_data
                            .with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                        state.target_cache.update_target_data(&updated);
                        limbo_free.push(updated);
                    }
                }
            }
            Ok(limbo_free)
        })?;

        for change in view_changes {
            self.local_view_references
                .add_references(change.added_keys.iter().cloned(), change.target_id);
            self.local_view_references
                .remove_references(&change.removed_keys, change.target_id);
        }
        for target_data in limbo_free {
            self.target_data_by_target
                .insert(target_data.target_id, target_data);
        }
        Ok(())
    }

    /// Local view of one document; missing documents come back invalid.
    pub fn read_document(&self, key: &DocumentKey) -> Document {
        local_documents_view::get_document(self.persistence.state(), key)
    }

    /// Keeps `key` from being collected while a limbo resolution for it is running.
    pub fn pin_limbo_document(&mut self, key: &DocumentKey, target_id: TargetId) {
        self.limbo_references.add_reference(key.clone(), target_id);
    }

    pub fn unpin_limbo_document(&mut self, key: &DocumentKey, target_id: TargetId) -> FirestoreResult<()> {
        self.limbo_references.remove_reference(key, target_id);
        self.persistence.run_transaction("Unpin limbo document", |state| {
            let sequence_number = state.target_cache.next_sequence_number();
            state
                .target_cache
                .update_document_sequence_number(key, sequence_number);
            Ok(())
        })
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.persistence
            .state()
            .target_cache
            .highest_listen_sequence_number()
    }

    /// One LRU pass over inactive targets and unreferenced documents.
    pub fn collect_garbage(&mut self) -> FirestoreResult<LruResults> {
        let active: BTreeSet<TargetId> = self.target_data_by_target.keys().copied().collect();
        let collector = &self.garbage_collector;
        let local_views = &self.local_view_references;
        let limbo = &self.limbo_references;
        self.persistence.run_transaction("Collect garbage", |state| {
            Ok(collector.collect(state, &active, |key| {
                local_views.contains_key(key) || limbo.contains_key(key)
            }))
        })
    }

    pub fn shutdown(&mut self) {
        self.persistence.shutdown();
    }
}

/// Shared tail of acknowledgement and rejection: rebuild overlays and age the keys.
fn finish_batch_removal(state: &mut PersistedState, batch: &MutationBatch, affected: &BTreeSet<DocumentKey>) {
    state
        .document_overlays
        .remove_overlays_for_batch_id(affected, batch.batch_id);
    local_documents_view::recalculate_and_save_overlays(state, affected);
    let sequence_number = state.target_cache.next_sequence_number();
    for key in affected {
        state
            .target_cache
            .update_document_sequence_number(key, sequence_number);
    }
}

/// Writes watch documents that are newer than the cache.
///
/// Returns the applied documents and the keys whose existence flipped.
fn populate_document_changes(
    state: &mut PersistedState,
    updates: &BTreeMap<DocumentKey, Document>,
    snapshot_version: SnapshotVersion,
) -> (BTreeMap<DocumentKey, Document>, BTreeSet<DocumentKey>) {
    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();
    let existing = state.remote_documents.get_entries(updates.keys());

    for (key, document) in updates {
        let current = existing
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid_document(key.clone()));
        if document.is_found_document() != current.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // Deleted with no version: the backend no longer knows the document.
            state.remote_documents.remove_entry(key);
            changed.insert(key.clone(), document.clone());
        } else if !current.is_valid_document()
            || document.version() > current.version()
            || (document.version() == current.version() && current.has_pending_writes())
        {
            let read_time = if document.read_time().is_min() {
                snapshot_version
            } else {
                document.read_time()
            };
            state.remote_documents.add_entry(document, read_time);
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "firestore: ignoring outdated watch update for {key}; current version {}, watch version {}",
                current.version(),
                document.version()
            );
        }
    }
    (changed, existence_changed)
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let elapsed = new.snapshot_version.timestamp().to_micros() - old.snapshot_version.timestamp().to_micros();
    if elapsed >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.change_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{FilterOperator, OrderDirection};
    use crate::firestore::error::{persistence_unavailable, FirestoreErrorCode};
    use crate::firestore::local::storage::{StorageBackend, StorageBatch, StorageImage};
    use crate::firestore::model::{FieldMask, FieldPath, MutationResult};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::sync::{Arc, Mutex};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        MapValue::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), FirestoreValue::from_integer(*v)))
                .collect(),
        )
    }

    fn store() -> LocalStore {
        LocalStore::new(
            Persistence::memory(&User::unauthenticated()),
            QueryEngine::default(),
            LruParams::disabled(),
            User::unauthenticated(),
        )
    }

    #[derive(Clone, Default)]
    struct SwitchableBackend {
        failing: Arc<Mutex<bool>>,
    }

    impl StorageBackend for SwitchableBackend {
        fn load(&mut self) -> FirestoreResult<StorageImage> {
            Ok(StorageImage::new())
        }

        fn commit(&mut self, _batch: &StorageBatch) -> FirestoreResult<()> {
            if *self.failing.lock().unwrap() {
                return Err(persistence_unavailable("disk full"));
            }
            Ok(())
        }

        fn is_durable(&self) -> bool {
            true
        }
    }

    fn ack(store: &mut LocalStore, batch_id: BatchId, at: SnapshotVersion) -> BTreeMap<DocumentKey, Document> {
        let batch = store.next_mutation_batch(batch_id - 1).unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(at, vec![]))
            .collect();
        let result = MutationBatchResult::from(batch, at, results, Bytes::from_static(b"token")).unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    fn doc_event(target_id: TargetId, document: Document, resume_token: &'static [u8]) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: Bytes::from_static(resume_token),
            current: true,
            ..TargetChange::default()
        };
        change.added_documents.insert(document.key().clone());
        let mut event = RemoteEvent {
            snapshot_version: document.version(),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(target_id, change);
        event.document_updates.insert(document.key().clone(), document);
        event
    }

    #[test]
    fn set_then_patch_survives_acknowledging_the_set() {
        let mut store = store();
        let a = key("rooms/a");
        let first = store.local_write(vec![Mutation::set(a.clone(), map(&[("x", 1)]))]).unwrap();
        let second = store
            .local_write(vec![Mutation::patch(
                a.clone(),
                map(&[("y", 2)]),
                FieldMask::new([FieldPath::from_dot_separated("y").unwrap()]),
            )])
            .unwrap();
        assert_eq!(second.changes[&a].data(), &map(&[("x", 1), ("y", 2)]));

        let changes = ack(&mut store, first.batch_id, version(5));
        let view = &changes[&a];
        assert_eq!(view.data(), &map(&[("x", 1), ("y", 2)]));
        assert_eq!(view.version(), version(5));
        assert!(view.has_local_mutations());
        assert_eq!(store.get_highest_unacknowledged_batch_id(), second.batch_id);
    }

    #[test]
    fn removing_a_batch_out_of_order_fails_loudly() {
        let mut store = store();
        store.local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))]).unwrap();
        let second = store.local_write(vec![Mutation::set(key("rooms/b"), map(&[("x", 2)]))]).unwrap();

        let batch = store.next_mutation_batch(second.batch_id - 1).unwrap();
        let result = MutationBatchResult::from(
            batch,
            version(3),
            vec![MutationResult::new(version(3), vec![])],
            Bytes::new(),
        )
        .unwrap();
        let err = store.acknowledge_batch(&result).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
        let err = store.reject_batch(second.batch_id).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
        assert!(store.read_document(&key("rooms/b")).has_local_mutations());
    }

    #[test]
    fn rejecting_a_batch_restores_the_remote_view() {
        let mut store = store();
        let write = store.local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))]).unwrap();
        let changes = store.reject_batch(write.batch_id).unwrap();
        assert!(!changes[&key("rooms/a")].is_found_document());
        assert!(!store.read_document(&key("rooms/a")).is_valid_document());
    }

    #[test]
    fn remote_updates_never_regress_versions() {
        let mut store = store();
        let query = Query::collection("rooms").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        let newer = Document::new_found_document(key("rooms/a"), version(10), map(&[("v", 10)]));
        store.apply_remote_event(&doc_event(target.target_id, newer, b"t1")).unwrap();

        let mut older_event = doc_event(
            target.target_id,
            Document::new_found_document(key("rooms/a"), version(10), map(&[("v", 4)])),
            b"",
        );
        older_event.snapshot_version = version(11);
        let changes = store.apply_remote_event(&older_event).unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.read_document(&key("rooms/a")).data(), &map(&[("v", 10)]));
    }

    #[test]
    fn resume_tokens_only_move_forward() {
        let mut store = store();
        let query = Query::collection("rooms").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        let document = Document::new_found_document(key("rooms/a"), version(10), map(&[("v", 1)]));
        store.apply_remote_event(&doc_event(target.target_id, document, b"newer")).unwrap();

        let mut stale = RemoteEvent {
            snapshot_version: SnapshotVersion::min(),
            ..RemoteEvent::default()
        };
        stale.target_changes.insert(
            target.target_id,
            TargetChange {
                resume_token: Bytes::from_static(b"older"),
                ..TargetChange::default()
            },
        );
        store.apply_remote_event(&stale).unwrap();

        let data = store.get_target_data(&query.to_target()).unwrap();
        assert_eq!(data.resume_token, Bytes::from_static(b"newer"));
        assert_eq!(data.snapshot_version, version(10));
        let persisted = store
            .persistence()
            .state()
            .target_cache
            .get_target_data_by_id(target.target_id)
            .unwrap();
        assert_eq!(persisted.resume_token, Bytes::from_static(b"newer"));
    }

    #[test]
    fn executes_queries_with_overlays_and_limits() {
        let mut store = store();
        for (id, n) in [("a", 5), ("b", 2), ("c", 9)] {
            store.local_write(vec![Mutation::set(key(&format!("rooms/{id}")), map(&[("n", n)]))]).unwrap();
        }
        let query = Query::collection("rooms")
            .unwrap()
            .filter(
                FieldPath::from_dot_separated("n").unwrap(),
                FilterOperator::GreaterThan,
                FirestoreValue::from_integer(1),
            )
            .unwrap()
            .order_by(FieldPath::from_dot_separated("n").unwrap(), OrderDirection::Ascending)
            .unwrap()
            .limit_to_first(2)
            .unwrap();
        let result = store.execute_query(&query, true).unwrap();
        let keys: Vec<String> = result.documents.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/b"]);
    }

    #[test]
    fn user_change_swaps_pending_writes() {
        let mut store = store();
        store.local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))]).unwrap();
        let change = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(change.removed_batch_ids.len(), 1);
        assert!(change.added_batch_ids.is_empty());
        assert!(!change.affected_documents[&key("rooms/a")].is_valid_document());

        let back = store.handle_user_change(User::unauthenticated()).unwrap();
        assert!(back.affected_documents[&key("rooms/a")].has_local_mutations());
    }

    #[test]
    fn released_targets_stay_cached_until_collected() {
        let mut store = store();
        let query = Query::collection("rooms").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        store.release_target(target.target_id).unwrap();
        assert!(store.get_active_target_data(target.target_id).is_none());
        let again = store.allocate_target(query.to_target()).unwrap();
        assert_eq!(again.target_id, target.target_id);
        assert!(store.release_target(99).is_err());
    }

    #[test]
    fn failed_commits_leave_view_references_and_targets_untouched() {
        let backend = SwitchableBackend::default();
        let user = User::unauthenticated();
        let persistence = Persistence::with_backend(Box::new(backend.clone()), &user).unwrap();
        let mut store = LocalStore::new(persistence, QueryEngine::default(), LruParams::disabled(), user);
        let query = Query::collection("rooms").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        let document = Document::new_found_document(key("rooms/a"), version(3), map(&[("v", 1)]));
        store.apply_remote_event(&doc_event(target.target_id, document, b"t1")).unwrap();
        store
            .notify_local_view_changes(&[LocalViewChanges {
                target_id: target.target_id,
                from_cache: true,
                added_keys: BTreeSet::from([key("rooms/a")]),
                ..LocalViewChanges::default()
            }])
            .unwrap();

        *backend.failing.lock().unwrap() = true;
        let synced = LocalViewChanges {
            target_id: target.target_id,
            from_cache: false,
            removed_keys: BTreeSet::from([key("rooms/a")]),
            ..LocalViewChanges::default()
        };
        assert!(store.notify_local_view_changes(&[synced]).is_err());
        assert!(store.local_view_references.contains_key(&key("rooms/a")));
        let active = store.get_active_target_data(target.target_id).unwrap();
        assert!(active.last_limbo_free_snapshot_version.is_min());

        assert!(store.release_target(target.target_id).is_err());
        assert!(store.get_active_target_data(target.target_id).is_some());
        assert!(store.local_view_references.contains_key(&key("rooms/a")));

        *backend.failing.lock().unwrap() = false;
        store.release_target(target.target_id).unwrap();
        assert!(store.get_active_target_data(target.target_id).is_none());
        assert!(store.local_view_references.is_empty());
    }
}
