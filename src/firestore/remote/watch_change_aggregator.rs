use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};

/// What the aggregator needs to know about targets the client is listening to.
pub trait TargetMetadataProvider {
    /// Keys the local cache currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for an active target, `None` once the client stopped listening.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Changes for one target accumulated since the last raised event.
#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests; responses for a pending target are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Bytes,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Bytes::new(),
            current: false,
            // A new target always raises its (possibly empty) initial change.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &Bytes) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let set = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            set.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds individual watch messages into [`RemoteEvent`]s.
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    /// Targets each pending document was added to.
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    /// Every target that mentioned each pending document.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange, provider: &dyn TargetMetadataProvider) {
        let found = change
            .new_document
            .as_ref()
            .filter(|document| document.is_found_document())
            .cloned();
        for target_id in &change.updated_target_ids {
            match &found {
                Some(document) => self.add_document_to_target(*target_id, document.clone(), provider),
                None => self.remove_document_from_target(
                    *target_id,
                    &change.key,
                    change.new_document.clone(),
                    provider,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_document.clone(), provider);
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange, provider: &dyn TargetMetadataProvider) {
        let target_ids: Vec<TargetId> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, provider) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // The first response after a (re-)listen starts from scratch.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, provider) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, provider) {
                        // Reset the target and synthesize removes for every cached key;
                        // the backend re-sends the full result set.
                        self.reset_target(target_id, provider);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend's count (and bloom filter) with what the cache holds.
    ///
    /// Any disagreement resets the target so it is re-listened from scratch; the
    /// filter only proves that something is missing, never which document.
    pub fn handle_existence_filter(&mut self, change: &ExistenceFilterChange, provider: &dyn TargetMetadataProvider) {
        let target_id = change.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
            return;
        };

        if target_data.target.is_document_target() {
            if change.count == 0 {
                // The document was deleted while the client was not listening.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let deleted = Document::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(deleted), provider);
                }
            } else if change.count != 1 {
                log::warn!(
                    "firestore: single document existence filter for target {target_id} reported count {}",
                    change.count
                );
            }
            return;
        }

        let current_keys = self.current_document_keys_for_target(target_id, provider);
        let purpose = if current_keys.len() as i64 != i64::from(change.count) {
            log::debug!(
                "firestore: existence filter mismatch for target {target_id}: backend has {}, cache has {}",
                change.count,
                current_keys.len()
            );
            Some(TargetPurpose::ExistenceFilterMismatch)
        } else if self.bloom_filter_rejects(change, &current_keys) {
            log::debug!("firestore: bloom filter proved a cached document of target {target_id} is gone");
            Some(TargetPurpose::ExistenceFilterMismatchBloom)
        } else {
            None
        };

        if let Some(purpose) = purpose {
            self.reset_target(target_id, provider);
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn bloom_filter_rejects(&self, change: &ExistenceFilterChange, keys: &BTreeSet<DocumentKey>) -> bool {
        let Some(payload) = &change.unchanged_names else {
            return false;
        };
        let filter = match BloomFilter::new(payload.bitmap.clone(), payload.padding, payload.hash_count) {
            Ok(filter) => filter,
            Err(err) => {
                log::warn!("firestore: ignoring malformed bloom filter: {err}");
                return false;
            }
        };
        if filter.bit_count() == 0 {
            return false;
        }
        let prefix = format!("{}/documents/", self.database_id.resource_name());
        keys.iter()
            .any(|key| !filter.might_contain(&format!("{prefix}{}", key.path().canonical_string())))
    }

    /// Builds an event from everything accumulated so far and resets the buffers.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        provider: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current single-document target that never produced the document
                // means the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let received = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !received && !self.target_contains_document(target_id, &key, provider) {
                        let deleted = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), provider);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, provider)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Called when the client sends a watch or unwatch request for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Forgets all per-target state, used when the listen stream restarts.
    pub fn clear(&mut self) {
        self.target_states.clear();
        self.pending_document_updates.clear();
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();
        self.pending_target_resets.clear();
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: Document, provider: &dyn TargetMetadataProvider) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, provider) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, provider);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The target never reported the document; drop any unraised add.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId, provider: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, provider);
        }
    }

    fn current_document_keys_for_target(
        &mut self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> BTreeSet<DocumentKey> {
        let change = self.ensure_target_state(target_id).to_target_change();
        let mut keys = provider.get_remote_keys_for_target(target_id);
        keys.extend(change.added_documents);
        for key in &change.removed_documents {
            keys.remove(key);
        }
        keys
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        provider: &dyn TargetMetadataProvider,
    ) -> bool {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }

    fn is_active_target(&self, target_id: TargetId, provider: &dyn TargetMetadataProvider) -> bool {
        let active = provider.get_target_data_for_target(target_id).is_some();
        if !active {
            log::debug!("firestore: detected inactive target {target_id}");
        }
        active
    }

    /// Target data for a target whose add/remove requests have all been answered.
    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.get_target_data_for_target(target_id),
        }
    }
}
