use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Target;
use crate::firestore::local::table::{JournaledTable, Table};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

const GLOBALS_KEY: &str = "target_globals";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct TargetGlobals {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: usize,
}

/// Target metadata and target membership (`target <-> document key`).
pub struct TargetCache {
    targets: Table<TargetId, TargetData>,
    target_documents: Table<(TargetId, DocumentKey), ()>,
    document_targets: Table<(DocumentKey, TargetId), ()>,
    document_sequence_numbers: Table<DocumentKey, ListenSequenceNumber>,
    globals: Table<String, TargetGlobals>,
}

impl TargetCache {
    pub(crate) fn new() -> Self {
        Self {
            targets: Table::new("targets"),
            target_documents: Table::new("target_documents"),
            document_targets: Table::new("document_targets"),
            document_sequence_numbers: Table::new("document_sequence_numbers"),
            globals: Table::new("target_globals"),
        }
    }

    fn globals(&self) -> TargetGlobals {
        self.globals.get(&GLOBALS_KEY.to_string()).cloned().unwrap_or_default()
    }

    fn update_globals(&mut self, update: impl FnOnce(&mut TargetGlobals)) {
        let mut globals = self.globals();
        update(&mut globals);
        self.globals.insert(GLOBALS_KEY.to_string(), globals);
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.globals().highest_target_id
    }

    pub fn highest_listen_sequence_number(&self) -> ListenSequenceNumber {
        self.globals().highest_listen_sequence_number
    }

    /// Allocates the next listen sequence number.
    pub fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        let next = self.highest_listen_sequence_number() + 1;
        self.update_globals(|globals| globals.highest_listen_sequence_number = next);
        next
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.globals().last_remote_snapshot_version
    }

    pub fn set_target_snapshot_version(&mut self, version: SnapshotVersion) {
        self.update_globals(|globals| globals.last_remote_snapshot_version = version);
    }

    pub fn target_count(&self) -> usize {
        self.globals().target_count
    }

    fn save_target_data(&mut self, target_data: &TargetData) {
        let target_id = target_data.target_id;
        let sequence_number = target_data.sequence_number;
        self.update_globals(|globals| {
            globals.highest_target_id = globals.highest_target_id.max(target_id);
            globals.highest_listen_sequence_number =
                globals.highest_listen_sequence_number.max(sequence_number);
        });
        self.targets.insert(target_id, target_data.clone());
    }

    pub fn add_target_data(&mut self, target_data: &TargetData) {
        self.save_target_data(target_data);
        self.update_globals(|globals| globals.target_count += 1);
    }

    pub fn update_target_data(&mut self, target_data: &TargetData) {
        self.save_target_data(target_data);
    }

    pub fn remove_target_data(&mut self, target_data: &TargetData) {
        self.remove_matching_keys_for_target_id(target_data.target_id);
        if self.targets.remove(&target_data.target_id).is_some() {
            self.update_globals(|globals| globals.target_count = globals.target_count.saturating_sub(1));
        }
    }

    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        let canonical_id = target.canonical_id();
        self.targets
            .iter()
            .map(|(_, data)| data)
            .find(|data| data.target.canonical_id() == canonical_id)
            .cloned()
    }

    pub fn get_target_data_by_id(&self, target_id: TargetId) -> Option<TargetData> {
        self.targets.get(&target_id).cloned()
    }

    pub fn all_target_data(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.iter().map(|(_, data)| data)
    }

    pub fn add_matching_keys<'a, I>(&mut self, keys: I, target_id: TargetId, sequence_number: ListenSequenceNumber)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.target_documents.insert((target_id, key.clone()), ());
            self.document_targets.insert((key.clone(), target_id), ());
            self.document_sequence_numbers.insert(key.clone(), sequence_number);
        }
    }

    pub fn remove_matching_keys<'a, I>(&mut self, keys: I, target_id: TargetId, sequence_number: ListenSequenceNumber)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.target_documents.remove(&(target_id, key.clone()));
            self.document_targets.remove(&(key.clone(), target_id));
            self.document_sequence_numbers.insert(key.clone(), sequence_number);
        }
    }

    pub fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) {
        for key in self.get_matching_keys_for_target_id(target_id) {
            self.target_documents.remove(&(target_id, key.clone()));
            self.document_targets.remove(&(key, target_id));
        }
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.target_documents
            .range((target_id, DocumentKey::min_key())..)
            .take_while(|((id, _), _)| *id == target_id)
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    /// Whether any cached target contains `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.document_targets
            .range((key.clone(), TargetId::MIN)..)
            .next()
            .map(|((candidate, _), _)| candidate == key)
            .unwrap_or(false)
    }

    /// Records that `key` was touched at `sequence_number`.
    pub fn update_document_sequence_number(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.document_sequence_numbers.insert(key.clone(), sequence_number);
    }

    pub(crate) fn document_sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber> {
        self.document_sequence_numbers.get(key).copied()
    }

    pub(crate) fn remove_document_sequence_number(&mut self, key: &DocumentKey) {
        self.document_sequence_numbers.remove(key);
    }

    pub(crate) fn tables_mut(&mut self) -> [&mut dyn JournaledTable; 5] {
        [
            &mut self.targets,
            &mut self.target_documents,
            &mut self.document_targets,
            &mut self.document_sequence_numbers,
            &mut self.globals,
        ]
    }
}
