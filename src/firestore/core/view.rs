use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::{OnlineState, TargetChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    None,
    /// Results come from the cache and may be behind the backend.
    Local,
    Synced,
}

/// A document entering or leaving limbo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of [`View::compute_doc_changes`], fed back into [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A limit boundary moved; the caller must re-run the query against the
    /// full local result set before applying.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The client-side result set of one query.
///
/// Tracks which documents the backend has confirmed for the target (`synced_documents`),
/// which have unacknowledged local writes, and which are in limbo: shown locally but
/// neither confirmed by the target nor explained by a pending write.
#[derive(Debug)]
pub struct View {
    query: Arc<Query>,
    current: bool,
    document_set: DocumentSet,
    sync_state: SyncState,
    limbo_documents: BTreeSet<DocumentKey>,
    synced_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Arc<Query>, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            document_set: DocumentSet::new(Arc::clone(&query)),
            query,
            current: false,
            sync_state: SyncState::None,
            limbo_documents: BTreeSet::new(),
            synced_documents,
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    /// Works out how `documents` would change the view without applying anything.
    ///
    /// Passing the result of an earlier call as `previous` continues from it; this is
    /// how a refill folds the full local result set on top of a first pass.
    pub fn compute_doc_changes(
        &self,
        documents: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::default(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first(),
            _ => None,
        };

        for (key, entry) in documents {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let mut applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new.clone(),
                            });
                            applied = true;

                            let past_last = last_doc_in_limit
                                .is_some_and(|last| self.query.compare(new, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .is_some_and(|first| self.query.compare(new, first) == Ordering::Less);
                            if past_last || before_first {
                                // The modified document may now belong outside the window, and
                                // an unseen document may belong inside it.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new.clone(),
                        });
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new.clone(),
                    });
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old.clone(),
                    });
                    applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_doc {
                    Some(new) => {
                        document_set.insert(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last(),
                    LimitType::Last => document_set.first(),
                }
                .cloned();
                let Some(evicted) = evicted else { break };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Commits `doc_changes` and, when anything observable changed, returns a snapshot.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        let query = &self.query;
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| query.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: Arc::clone(&self.query),
            documents: self.document_set.clone(),
            old_documents,
            document_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline makes a current view fall back to `from_cache`.
    pub fn apply_online_state_change(&mut self, state: OnlineState) -> ViewChange {
        if self.current && state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::default(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Snapshot of the current contents with every document reported as added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            Arc::clone(&self.query),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == SyncState::Local,
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.modified_documents {
            debug_assert!(
                self.synced_documents.contains(key),
                "modified document {key} was never added"
            );
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Limbo is only meaningful once the target is consistent with the backend.
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    fn should_be_in_limbo(&self, document: &Document) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// A locally modified document whose write was just acknowledged is held back until
/// the watch stream delivers the committed version.
fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::OrderDirection;
    use crate::firestore::model::{FieldPath, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use bytes::Bytes;

    fn doc(path: &str, n: i64) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(n));
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::new(fields),
        )
    }

    fn docs(list: &[Document]) -> BTreeMap<DocumentKey, Document> {
        list.iter().map(|d| (d.key().clone(), d.clone())).collect()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn by_n() -> Query {
        Query::collection("rooms")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("n").unwrap(), OrderDirection::Ascending)
            .unwrap()
    }

    fn current_change(added: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: Bytes::from_static(b"token"),
            current: true,
            added_documents: added.iter().map(|p| key(p)).collect(),
            ..TargetChange::default()
        }
    }

    fn apply(view: &mut View, list: &[Document], change: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&docs(list), None);
        view.apply_changes(changes, true, change, false)
    }

    #[test]
    fn first_snapshot_is_from_cache_until_current() {
        let mut view = View::new(Arc::new(by_n()), BTreeSet::new());
        let change = apply(&mut view, &[doc("rooms/a", 1)], None);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert_eq!(snapshot.document_changes.len(), 1);

        let change = apply(&mut view, &[], Some(&current_change(&["rooms/a"])));
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.document_changes.is_empty());
        assert!(snapshot.has_cached_results);
        assert_eq!(view.sync_state(), SyncState::Synced);
    }

    #[test]
    fn limit_evicts_the_document_pushed_past_the_boundary() {
        let query = by_n().limit_to_first(1).unwrap();
        let mut view = View::new(Arc::new(query), BTreeSet::new());
        apply(&mut view, &[doc("rooms/k1", 5)], None);

        let change = apply(&mut view, &[doc("rooms/k2", 2)], None);
        let snapshot = change.snapshot.unwrap();
        let kinds: Vec<(ChangeType, &str)> = snapshot
            .document_changes
            .iter()
            .map(|c| (c.change_type, c.document.key().id()))
            .collect();
        assert_eq!(kinds, vec![(ChangeType::Removed, "k1"), (ChangeType::Added, "k2")]);
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(snapshot.documents.first().unwrap().key().id(), "k2");
    }

    #[test]
    fn modifying_the_boundary_document_requests_a_refill() {
        let query = by_n().limit_to_first(1).unwrap();
        let mut view = View::new(Arc::new(query), BTreeSet::new());
        apply(&mut view, &[doc("rooms/k1", 5)], None);

        let changes = view.compute_doc_changes(&docs(&[doc("rooms/k1", 9)]), None);
        assert!(changes.needs_refill);

        let changes = view.compute_doc_changes(&docs(&[doc("rooms/k1", 3)]), None);
        assert!(!changes.needs_refill);
    }

    #[test]
    fn unsynced_documents_enter_limbo_once_current() {
        let mut view = View::new(Arc::new(by_n()), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);

        let change = apply(&mut view, &[], Some(&current_change(&["rooms/a"])));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        // Still from cache with nothing changed, so there is nothing to raise.
        assert!(change.snapshot.is_none());
        assert_eq!(view.sync_state(), SyncState::Local);

        let removal = TargetChange {
            current: true,
            ..TargetChange::default()
        };
        let deleted = Document::new_no_document(key("rooms/b"), SnapshotVersion::new(Timestamp::new(2, 0)));
        let change = apply(&mut view, &[deleted], Some(&removal));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        assert!(!change.snapshot.unwrap().from_cache);
    }

    #[test]
    fn going_offline_marks_results_from_cache() {
        let mut view = View::new(Arc::new(by_n()), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1)], Some(&current_change(&["rooms/a"])));
        assert_eq!(view.sync_state(), SyncState::Synced);

        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.document_changes.is_empty());

        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }

    #[test]
    fn unchanged_input_raises_nothing() {
        let mut view = View::new(Arc::new(by_n()), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1)], None);
        let change = apply(&mut view, &[doc("rooms/a", 1)], None);
        assert!(change.snapshot.is_none());
    }
}
