//! Sequence-number based eviction of inactive targets and orphaned documents.

use std::collections::{BTreeSet, BinaryHeap};

use crate::firestore::local::persistence::PersistedState;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};
use crate::firestore::settings::FirestoreSettings;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LruParams {
    /// Collection is skipped while the cache is smaller than this; `None` disables it.
    pub cache_size_collection_threshold: Option<u64>,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn from_settings(settings: &FirestoreSettings) -> Self {
        Self {
            cache_size_collection_threshold: settings.cache_size_bytes,
            percentile_to_collect: settings.gc_percentile,
            maximum_sequence_numbers_to_collect: settings.max_sequence_numbers_to_collect,
        }
    }

    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: None,
            percentile_to_collect: 0,
            maximum_sequence_numbers_to_collect: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs one collection pass if the cache has grown past the threshold.
    ///
    /// Targets in `active_targets` are never removed. A document is kept while any
    /// target holds it, any user's pending mutation touches it, or `is_pinned` says
    /// an in-memory view or limbo resolution refers to it.
    pub(crate) fn collect<P>(
        &self,
        state: &mut PersistedState,
        active_targets: &BTreeSet<TargetId>,
        is_pinned: P,
    ) -> LruResults
    where
        P: Fn(&DocumentKey) -> bool,
    {
        let Some(threshold) = self.params.cache_size_collection_threshold else {
            log::debug!("firestore: garbage collection skipped; disabled");
            return LruResults::default();
        };
        let cache_size = state.remote_documents.byte_size();
        if cache_size < threshold {
            log::debug!(
                "firestore: garbage collection skipped; cache size {cache_size} is lower than threshold {threshold}"
            );
            return LruResults::default();
        }
        self.run(state, active_targets, is_pinned)
    }

    fn run<P>(&self, state: &mut PersistedState, active_targets: &BTreeSet<TargetId>, is_pinned: P) -> LruResults
    where
        P: Fn(&DocumentKey) -> bool,
    {
        let candidates = self.sequence_numbers(state, active_targets, &is_pinned);
        let count = (candidates.len() * self.params.percentile_to_collect as usize / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);
        if count == 0 {
            log::debug!("firestore: garbage collection found nothing to collect");
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        }
        let Some(upper_bound) = nth_sequence_number(candidates, count) else {
            return LruResults::default();
        };

        let targets_removed = remove_targets(state, upper_bound, active_targets);
        let documents_removed = remove_orphaned_documents(state, upper_bound, &is_pinned);
        log::debug!(
            "firestore: garbage collection removed {targets_removed} targets and {documents_removed} documents (upper bound {upper_bound})"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: count,
            targets_removed,
            documents_removed,
        }
    }

    fn sequence_numbers<P>(
        &self,
        state: &PersistedState,
        active_targets: &BTreeSet<TargetId>,
        is_pinned: &P,
    ) -> Vec<ListenSequenceNumber>
    where
        P: Fn(&DocumentKey) -> bool,
    {
        let mut sequence_numbers: Vec<ListenSequenceNumber> = state
            .target_cache
            .all_target_data()
            .filter(|data| !active_targets.contains(&data.target_id))
            .map(|data| data.sequence_number)
            .collect();
        for key in state.remote_documents.keys() {
            if is_referenced(state, key, is_pinned) {
                continue;
            }
            sequence_numbers.push(
                state
                    .target_cache
                    .document_sequence_number(key)
                    .unwrap_or(INVALID_SEQUENCE_NUMBER),
            );
        }
        sequence_numbers
    }
}

fn is_referenced<P>(state: &PersistedState, key: &DocumentKey, is_pinned: &P) -> bool
where
    P: Fn(&DocumentKey) -> bool,
{
    state.target_cache.contains_key(key)
        || state.mutation_queue.contains_key_for_any_user(key)
        || is_pinned(key)
}

/// The `n`th smallest sequence number (1-based).
fn nth_sequence_number(sequence_numbers: Vec<ListenSequenceNumber>, n: usize) -> Option<ListenSequenceNumber> {
    let mut heap: BinaryHeap<ListenSequenceNumber> = BinaryHeap::with_capacity(n + 1);
    for sequence_number in sequence_numbers {
        if heap.len() < n {
            heap.push(sequence_number);
        } else if heap.peek().is_some_and(|largest| sequence_number < *largest) {
            heap.pop();
            heap.push(sequence_number);
        }
    }
    heap.peek().copied()
}

fn remove_targets(
    state: &mut PersistedState,
    upper_bound: ListenSequenceNumber,
    active_targets: &BTreeSet<TargetId>,
) -> usize {
    let doomed: Vec<_> = state
        .target_cache
        .all_target_data()
        .filter(|data| data.sequence_number <= upper_bound && !active_targets.contains(&data.target_id))
        .cloned()
        .collect();
    for target_data in &doomed {
        let keys = state
            .target_cache
            .get_matching_keys_for_target_id(target_data.target_id);
        state.target_cache.remove_target_data(target_data);
        // Released documents age from the target's last use.
        for key in &keys {
            state
                .target_cache
                .update_document_sequence_number(key, target_data.sequence_number);
        }
    }
    doomed.len()
}

fn remove_orphaned_documents<P>(state: &mut PersistedState, upper_bound: ListenSequenceNumber, is_pinned: &P) -> usize
where
    P: Fn(&DocumentKey) -> bool,
{
    let doomed: Vec<DocumentKey> = state
        .remote_documents
        .keys()
        .filter(|key| {
            !is_referenced(state, key, is_pinned)
                && state
                    .target_cache
                    .document_sequence_number(key)
                    .unwrap_or(INVALID_SEQUENCE_NUMBER)
                    <= upper_bound
        })
        .cloned()
        .collect();
    for key in &doomed {
        state.remote_documents.remove_entry(key);
        state.target_cache.remove_document_sequence_number(key);
    }
    doomed.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::credentials::User;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::local::target_data::{TargetData, TargetPurpose};
    use crate::firestore::model::{Document, Mutation, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn always_collect() -> LruGarbageCollector {
        LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: Some(0),
            percentile_to_collect: 50,
            maximum_sequence_numbers_to_collect: 1000,
        })
    }

    fn add_document(state: &mut PersistedState, path: &str, sequence_number: ListenSequenceNumber) {
        let document = Document::new_found_document(
            key(path),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::empty(),
        );
        state.remote_documents.add_entry(&document, document.version());
        state
            .target_cache
            .update_document_sequence_number(&key(path), sequence_number);
    }

    fn add_target(state: &mut PersistedState, collection: &str, target_id: TargetId, sequence_number: ListenSequenceNumber, keys: &[&str]) {
        let target = Query::collection(collection).unwrap().to_target();
        let data = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
        state.target_cache.add_target_data(&data);
        let keys: Vec<DocumentKey> = keys.iter().map(|path| key(path)).collect();
        state.target_cache.add_matching_keys(&keys, target_id, sequence_number);
    }

    #[test]
    fn finds_nth_smallest() {
        assert_eq!(nth_sequence_number(vec![9, 3, 7, 1, 5], 2), Some(3));
        assert_eq!(nth_sequence_number(vec![4], 1), Some(4));
        assert_eq!(nth_sequence_number(vec![], 1), None);
    }

    #[test]
    fn skips_below_threshold() {
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: Some(u64::MAX),
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        let mut persistence = Persistence::memory(&User::unauthenticated());
        let results = persistence
            .run_transaction("gc", |state| {
                add_document(state, "a/1", 1);
                Ok(gc.collect(state, &BTreeSet::new(), |_| false))
            })
            .unwrap();
        assert!(!results.did_run);
        assert_eq!(persistence.state().remote_documents.len(), 1);
    }

    #[test]
    fn never_evicts_referenced_documents_and_converges() {
        let gc = always_collect();
        let mut persistence = Persistence::memory(&User::unauthenticated());
        persistence
            .run_transaction("seed", |state| {
                for i in 0..10 {
                    add_document(state, &format!("orphans/{i}"), i);
                }
                add_document(state, "active/held", 1);
                add_document(state, "stale/held", 2);
                add_document(state, "pending/write", 0);
                add_document(state, "pinned/view", 0);
                add_target(state, "active", 2, 1, &["active/held"]);
                add_target(state, "stale", 4, 2, &["stale/held"]);
                state
                    .mutation_queue
                    .add_mutation_batch(Timestamp::now(), vec![Mutation::delete(key("pending/write"))]);
                Ok(())
            })
            .unwrap();

        let active: BTreeSet<TargetId> = [2].into_iter().collect();
        let pinned = |candidate: &DocumentKey| candidate == &key("pinned/view");
        let mut total_removed = 0;
        for _ in 0..20 {
            let results = persistence
                .run_transaction("gc", |state| Ok(gc.collect(state, &active, pinned)))
                .unwrap();
            total_removed += results.documents_removed;
            if results.documents_removed == 0 && results.targets_removed == 0 {
                break;
            }
        }

        let state = persistence.state();
        assert!(total_removed > 0);
        assert!(state.remote_documents.contains(&key("active/held")));
        assert!(state.remote_documents.contains(&key("pending/write")));
        assert!(state.remote_documents.contains(&key("pinned/view")));
        assert!(state.target_cache.get_target_data_by_id(2).is_some());
        assert!(state.target_cache.get_target_data_by_id(4).is_none());

        let again = persistence
            .run_transaction("gc", |state| Ok(gc.collect(state, &active, pinned)))
            .unwrap();
        assert_eq!(again.targets_removed, 0);
        assert_eq!(again.documents_removed, 0);
    }
}
