use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::oneshot;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, ListenerId, SnapshotObserver};
use crate::firestore::core::query::Query;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::view::{LimboDocumentChange, View, ViewChange};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::credentials::User;
use crate::firestore::error::{cancelled, internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::{LocalStore, LocalViewChanges, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId,
    BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::remote::{OnlineState, RemoteEvent, RemoteSyncer, TargetChange};

/// Completion handle for a write or a wait on pending writes.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Work the sync engine needs from the remote store. Buffered and drained by the
/// owner after every operation, since the remote store calls back into the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCommand {
    Listen(TargetData),
    Unlisten(TargetId),
    FillWritePipeline,
}

struct QueryView {
    query: Arc<Query>,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// The limbo target reported the document; its removal then means a delete.
    received_document: bool,
}

/// Turns local writes and remote events into per-query snapshots.
///
/// Owns the [`LocalStore`] and the [`EventManager`]. A document that a query's view
/// shows but the backend no longer reports for the query's target is "in limbo";
/// the engine listens to a dedicated single-document target to find out whether it
/// was deleted or merely stopped matching. At most `max_concurrent_limbo_resolutions`
/// such targets run at once, the rest wait in a queue.
pub struct SyncEngine {
    local_store: LocalStore,
    event_manager: EventManager,
    query_views_by_query: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Arc<Query>>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views currently keep each limbo document in limbo.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    mutation_user_callbacks: BTreeMap<User, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    current_user: User,
    online_state: OnlineState,
    remote_commands: VecDeque<RemoteCommand>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, max_concurrent_limbo_resolutions: usize) -> Self {
        Self {
            current_user: local_store.user().clone(),
            local_store,
            event_manager: EventManager::new(),
            query_views_by_query: HashMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            max_concurrent_limbo_resolutions: max_concurrent_limbo_resolutions.max(1),
            mutation_user_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            remote_commands: VecDeque::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Commands for the remote store queued by the last operations.
    pub fn take_remote_commands(&mut self) -> Vec<RemoteCommand> {
        self.remote_commands.drain(..).collect()
    }

    pub fn active_limbo_documents(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Attaches `observer` to `query`; the first listener on a query starts listening.
    pub fn add_listener(&mut self, query: Query, options: ListenOptions, observer: SnapshotObserver) -> ListenerId {
        let query = Arc::new(query);
        let (listener_id, first) = self
            .event_manager
            .add_listener(Arc::clone(&query), options, observer);
        if first {
            match self.listen(&query) {
                Ok(snapshot) => self.event_manager.on_view_snapshots(vec![snapshot]),
                Err(err) => {
                    log::warn!("firestore: failed to listen to {}: {err}", query.canonical_id());
                    self.event_manager.on_listen_error(&query, err);
                }
            }
        }
        listener_id
    }

    /// Detaches a listener; the last listener on a query stops listening.
    pub fn remove_listener(&mut self, listener_id: ListenerId) {
        if let Some((query, true)) = self.event_manager.remove_listener(listener_id) {
            if let Err(err) = self.unlisten(&query) {
                log::warn!("firestore: failed to unlisten from {}: {err}", query.canonical_id());
            }
        }
    }

    fn listen(&mut self, query: &Arc<Query>) -> FirestoreResult<ViewSnapshot> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let snapshot = self.initialize_view_and_compute_snapshot(query, target_id, target_data.resume_token.clone())?;
        self.remote_commands
            .push_back(RemoteCommand::Listen(target_data));
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: &Arc<Query>,
        target_id: TargetId,
        resume_token: Bytes,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(Arc::clone(query), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange {
            resume_token,
            current: false,
            ..TargetChange::default()
        };
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("a new view must produce a snapshot"))?;

        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(Arc::clone(query));
        self.query_views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query: Arc::clone(query),
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    fn unlisten(&mut self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(query_view) = self.query_views_by_query.remove(&canonical_id) else {
            return Err(internal_error(format!("no active query view for {canonical_id}")));
        };
        let target_id = query_view.target_id;

        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            queries.retain(|candidate| candidate.canonical_id() != canonical_id);
            if !queries.is_empty() {
                return Ok(());
            }
        }

        let released = self.local_store.release_target(target_id);
        self.remote_commands
            .push_back(RemoteCommand::Unlisten(target_id));
        self.remove_and_cleanup_target(target_id, None);
        released
    }

    /// Applies `mutations` locally and queues them for the backend. `callback`
    /// resolves once the backend accepts or rejects the batch.
    pub fn write(&mut self, mutations: Vec<Mutation>, callback: WriteCallback) {
        let result = match self.local_store.local_write(mutations) {
            Ok(result) => result,
            Err(err) => {
                log::warn!("firestore: dropping write that could not be saved locally: {err}");
                let _ = callback.send(Err(err));
                return;
            }
        };
        self.mutation_user_callbacks
            .entry(self.current_user.clone())
            .or_default()
            .insert(result.batch_id, callback);

        if let Err(err) = self.emit_new_snaps_and_notify_local_store(result.changes, None) {
            log::warn!("firestore: failed to raise snapshots after write: {err}");
        }
        self.remote_commands
            .push_back(RemoteCommand::FillWritePipeline);
    }

    /// Resolves `callback` once every batch queued so far is acknowledged or rejected.
    pub fn register_pending_writes_callback(&mut self, callback: WriteCallback) {
        let highest = self.local_store.get_highest_unacknowledged_batch_id();
        if highest == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return;
        }
        self.pending_writes_callbacks
            .entry(highest)
            .or_default()
            .push(callback);
    }

    /// Runs `query` against the local cache only.
    pub fn get_from_cache(&mut self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let query = Arc::new(query);
        let result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(Arc::clone(&query), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        view.apply_changes(doc_changes, false, None, false)
            .snapshot
            .ok_or_else(|| internal_error("a new view must produce a snapshot"))
    }

    /// Cached state of one document; `None` when the cache knows it does not exist.
    pub fn get_document_from_cache(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        let document = self.local_store.read_document(key);
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(format!(
                "document {key} is not in the cache; it may still exist on the server"
            )))
        }
    }

    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.query_views_by_query.values_mut() {
            // A view that cannot be refreshed keeps its previous state; the others still advance.
            let view_change = match apply_doc_changes(&mut self.local_store, query_view, &changes, remote_event) {
                Ok(view_change) => view_change,
                Err(err) => {
                    log::warn!(
                        "firestore: failed to update view for {}: {err}",
                        query_view.query.canonical_id()
                    );
                    continue;
                }
            };
            limbo_updates.push((query_view.target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(query_view.target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }
        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes);
        }

        self.event_manager.on_view_snapshots(snapshots);
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, limbo_changes: Vec<LimboDocumentChange>) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs
                        .add_reference(key.clone(), target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("firestore: document {key} no longer in limbo");
                    self.limbo_document_refs
                        .remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        log::debug!("firestore: new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts queued limbo resolutions while below the concurrency cap.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), target_id);
            self.local_store.pin_limbo_document(&key, target_id);
            self.remote_commands
                .push_back(RemoteCommand::Listen(TargetData::new(
                    Query::document(&key).to_target(),
                    target_id,
                    TargetPurpose::LimboResolution,
                    INVALID_SEQUENCE_NUMBER,
                )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions
            .retain(|candidate| candidate != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        self.active_limbo_resolutions_by_target.remove(&target_id);
        self.remote_commands
            .push_back(RemoteCommand::Unlisten(target_id));
        if let Err(err) = self.local_store.unpin_limbo_document(key, target_id) {
            log::warn!("firestore: failed to unpin limbo document {key}: {err}");
        }
        self.pump_enqueued_limbo_resolutions();
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<FirestoreError>) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views_by_query.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.event_manager.on_listen_error(&query, error.clone());
            }
        }

        let limbo_keys = self.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        let callback = self
            .mutation_user_callbacks
            .get_mut(&self.current_user)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(cancelled(message)));
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            if change.change_count() > 1 {
                return Err(internal_error(format!(
                    "limbo resolution target {target_id} reported more than one document"
                )));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error(format!(
                        "limbo target {target_id} modified a document it never added"
                    )));
                }
            } else if !change.removed_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error(format!(
                        "limbo target {target_id} removed a document it never added"
                    )));
                }
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            // Without access to the document, treat it as deleted.
            let key = resolution.key.clone();
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                Document::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key.clone());
            self.apply_remote_event(event)?;

            // Usually already released while applying the delete.
            if self.active_limbo_resolutions_by_target.remove(&target_id).is_some() {
                self.active_limbo_targets_by_key.remove(&key);
                if let Err(err) = self.local_store.unpin_limbo_document(&key, target_id) {
                    log::warn!("firestore: failed to unpin limbo document {key}: {err}");
                }
            }
            self.pump_enqueued_limbo_resolutions();
            return Ok(());
        }

        log::warn!("firestore: listen to target {target_id} rejected: {error}");
        let released = self.local_store.release_target(target_id);
        self.remove_and_cleanup_target(target_id, Some(error));
        released
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        log::warn!("firestore: write batch {batch_id} rejected: {error}");
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None)
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            return if resolution.received_document {
                BTreeSet::from([resolution.key.clone()])
            } else {
                BTreeSet::new()
            };
        }
        let mut keys = BTreeSet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views_by_query.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn next_mutation_batch(&mut self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self.local_store.next_mutation_batch(after_batch_id))
    }

    fn set_last_stream_token(&mut self, stream_token: Bytes) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(stream_token)
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.last_remote_snapshot_version()
    }

    fn handle_online_state_change(&mut self, state: OnlineState) {
        self.online_state = state;
        let mut snapshots = Vec::new();
        for query_view in self.query_views_by_query.values_mut() {
            let view_change = query_view.view.apply_online_state_change(state);
            if !view_change.limbo_changes.is_empty() {
                log::error!("firestore: online state change produced limbo changes");
            }
            if let Some(snapshot) = view_change.snapshot {
                snapshots.push(snapshot);
            }
        }
        self.event_manager.on_online_state_change(state);
        self.event_manager.on_view_snapshots(snapshots);
    }

    fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        if user == self.current_user {
            return Ok(());
        }
        log::debug!("firestore: user changed from {} to {user}", self.current_user);
        let result = self.local_store.handle_user_change(user.clone())?;

        if let Some(callbacks) = self.mutation_user_callbacks.remove(&self.current_user) {
            for callback in callbacks.into_values() {
                let _ = callback.send(Err(cancelled("write abandoned after a user change")));
            }
        }
        self.reject_outstanding_pending_writes_callbacks("pending writes wait abandoned after a user change");
        self.current_user = user;

        self.emit_new_snaps_and_notify_local_store(result.affected_documents, None)
    }
}

/// Runs the view's diff for `changes`, re-querying the cache when a limit boundary moved.
fn apply_doc_changes(
    local_store: &mut LocalStore,
    query_view: &mut QueryView,
    changes: &BTreeMap<DocumentKey, Document>,
    remote_event: Option<&RemoteEvent>,
) -> FirestoreResult<ViewChange> {
    let view = &mut query_view.view;
    let mut doc_changes = view.compute_doc_changes(changes, None);
    if doc_changes.needs_refill {
        let result = local_store.execute_query(&query_view.query, false)?;
        doc_changes = view.compute_doc_changes(&result.documents, Some(doc_changes));
        doc_changes.needs_refill = false;
    }

    let target_id = query_view.target_id;
    let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
    let pending_reset = remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
    Ok(view.apply_changes(doc_changes, true, target_change, pending_reset))
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}
