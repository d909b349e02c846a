//! Chooses how a query is answered from the cache.
//!
//! Candidates come from the target's previous results plus documents changed since
//! it was last limbo-free, then from a field index when one serves the query, and
//! finally from a full collection scan. Scans that read many more documents
//! than they return create indexes for the next run.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{FilterOperator, LimitType, Query};
use crate::firestore::local::local_documents_view;
use crate::firestore::local::persistence::PersistedState;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};
use crate::firestore::settings::FirestoreSettings;

/// Per-execution counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryContext {
    pub documents_read_count: usize,
}

#[derive(Clone, Debug)]
pub struct QueryEngine {
    auto_index_creation: bool,
    min_collection_size: usize,
    relative_read_cost: f64,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self {
            auto_index_creation: true,
            min_collection_size: crate::firestore::settings::DEFAULT_INDEX_MIN_COLLECTION_SIZE,
            relative_read_cost: crate::firestore::settings::DEFAULT_RELATIVE_INDEX_READ_COST,
        }
    }
}

impl QueryEngine {
    pub fn new(settings: &FirestoreSettings) -> Self {
        Self {
            auto_index_creation: settings.auto_index_creation,
            min_collection_size: settings.index_min_collection_size,
            relative_read_cost: settings.relative_index_read_cost,
        }
    }

    pub fn set_auto_index_creation(&mut self, enabled: bool) {
        self.auto_index_creation = enabled;
    }

    /// Local views of every cached document matching `query`, limits applied.
    pub(crate) fn get_documents_matching_query(
        &self,
        state: &mut PersistedState,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Document> {
        if let Some(results) = self.perform_query_using_remote_keys(
            state,
            query,
            last_limbo_free_snapshot_version,
            remote_keys,
        ) {
            return results;
        }
        if let Some(results) = self.perform_query_using_index(state, query) {
            return results;
        }

        let mut context = QueryContext::default();
        let results = local_documents_view::get_documents_matching_query(
            state,
            query,
            SnapshotVersion::min(),
            &mut context,
        );
        if self.auto_index_creation {
            self.create_cache_indexes(state, query, &context, results.len());
        }
        apply_limit(query, results)
    }

    fn perform_query_using_index(
        &self,
        state: &PersistedState,
        query: &Query,
    ) -> Option<BTreeMap<DocumentKey, Document>> {
        let candidates = state.remote_documents.index_manager().candidate_keys(query)?;
        log::trace!(
            "firestore: using index for query {} ({} candidates)",
            query.canonical_id(),
            candidates.len()
        );
        let results =
            local_documents_view::get_documents_matching_candidates(state, query, &candidates);
        Some(apply_limit(query, results))
    }

    fn perform_query_using_remote_keys(
        &self,
        state: &PersistedState,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> Option<BTreeMap<DocumentKey, Document>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return None;
        }

        let previous: Vec<Document> = local_documents_view::get_documents(state, remote_keys)
            .into_values()
            .filter(|document| query.matches(document))
            .collect();
        let mut sorted = previous.clone();
        sorted.sort_by(|left, right| query.compare(left, right));

        if query.has_limit()
            && needs_refill(query, &sorted, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        log::trace!(
            "firestore: re-using previous result from {:?} for query {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );
        let mut context = QueryContext::default();
        let mut results = local_documents_view::get_documents_matching_query(
            state,
            query,
            last_limbo_free_snapshot_version,
            &mut context,
        );
        for document in previous {
            results.insert(document.key().clone(), document);
        }
        Some(apply_limit(query, results))
    }

    fn create_cache_indexes(
        &self,
        state: &mut PersistedState,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) {
        if context.documents_read_count < self.min_collection_size {
            return;
        }
        if (context.documents_read_count as f64) <= self.relative_read_cost * result_size as f64 {
            return;
        }
        let Some(group) = query
            .collection_group_id()
            .or_else(|| query.path().last_segment())
            .map(str::to_string)
        else {
            return;
        };
        for filter in query.filters() {
            if filter.field().is_document_id()
                || matches!(
                    filter.operator(),
                    FilterOperator::NotEqual | FilterOperator::NotIn
                )
            {
                continue;
            }
            log::debug!(
                "firestore: query {} scanned {} documents for {} results, indexing {}",
                query.canonical_id(),
                context.documents_read_count,
                result_size,
                filter.field()
            );
            state
                .remote_documents
                .create_field_index(&group, filter.field().clone());
        }
    }
}

/// Whether the previous results of a limit query might be missing documents.
///
/// A document that left the result set, or an edge document that changed after the
/// target was last consistent, means the limit window has to be recomputed.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[Document],
    remote_keys: &BTreeSet<DocumentKey>,
    last_limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > last_limbo_free_snapshot_version
        }
        None => false,
    }
}

fn apply_limit(query: &Query, results: BTreeMap<DocumentKey, Document>) -> BTreeMap<DocumentKey, Document> {
    let Some(limit) = query.limit() else {
        return results;
    };
    let mut sorted: Vec<Document> = results.into_values().collect();
    sorted.sort_by(|left, right| query.compare(left, right));
    let limit = limit as usize;
    let kept: Vec<Document> = match query.limit_type() {
        LimitType::First => sorted.into_iter().take(limit).collect(),
        LimitType::Last => {
            let skip = sorted.len().saturating_sub(limit);
            sorted.into_iter().skip(skip).collect()
        }
    };
    kept.into_iter()
        .map(|document| (document.key().clone(), document))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::OrderDirection;
    use crate::firestore::credentials::User;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::model::{FieldMask, FieldPath, Mutation};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, version: i64, n: i64) -> Document {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(n));
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(crate::firestore::model::Timestamp::new(version, 0)),
            MapValue::new(fields),
        )
    }

    fn seeded(count: i64) -> Persistence {
        let mut persistence = Persistence::memory(&User::unauthenticated());
        persistence
            .run_transaction("seed", |state| {
                for i in 0..count {
                    let document = doc(&format!("items/d{i:03}"), 1, i);
                    state.remote_documents.add_entry(&document, document.version());
                }
                Ok(())
            })
            .unwrap();
        persistence
    }

    fn n_query(op: FilterOperator, value: i64) -> Query {
        Query::collection("items")
            .unwrap()
            .filter(
                FieldPath::from_dot_separated("n").unwrap(),
                op,
                FirestoreValue::from_integer(value),
            )
            .unwrap()
    }

    #[test]
    fn scan_creates_index_and_index_answers_identically() {
        let mut persistence = seeded(150);
        let engine = QueryEngine::default();
        let query = n_query(FilterOperator::Equal, 7);

        let scanned = persistence
            .run_transaction("scan", |state| {
                Ok(engine.get_documents_matching_query(
                    state,
                    &query,
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                ))
            })
            .unwrap();
        let state = persistence.state();
        assert!(state
            .remote_documents
            .index_manager()
            .has_field_index("items", &FieldPath::from_dot_separated("n").unwrap()));

        let indexed = engine.perform_query_using_index(state, &query).unwrap();
        assert_eq!(
            scanned.keys().collect::<Vec<_>>(),
            indexed.keys().collect::<Vec<_>>()
        );
        assert_eq!(indexed.len(), 1);

        let range = n_query(FilterOperator::GreaterThanOrEqual, 140);
        let mut context = QueryContext::default();
        let by_scan = local_documents_view::get_documents_matching_query(
            state,
            &range,
            SnapshotVersion::min(),
            &mut context,
        );
        let by_index = engine.perform_query_using_index(state, &range).unwrap();
        assert_eq!(by_scan.keys().collect::<Vec<_>>(), by_index.keys().collect::<Vec<_>>());
    }

    #[test]
    fn small_collections_are_not_indexed() {
        let mut persistence = seeded(10);
        let engine = QueryEngine::default();
        let query = n_query(FilterOperator::Equal, 3);
        persistence
            .run_transaction("scan", |state| {
                Ok(engine.get_documents_matching_query(
                    state,
                    &query,
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                ))
            })
            .unwrap();
        assert_eq!(persistence.state().remote_documents.index_manager().field_indexes().count(), 0);
    }

    #[test]
    fn limit_query_refills_when_a_previous_result_left() {
        let mut persistence = seeded(5);
        let engine = QueryEngine::default();
        let query = Query::collection("items")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("n").unwrap(), OrderDirection::Ascending)
            .unwrap()
            .limit_to_first(2)
            .unwrap();
        let remote_keys: BTreeSet<DocumentKey> = ["items/d000", "items/d001"]
            .iter()
            .map(|path| DocumentKey::from_string(path).unwrap())
            .collect();
        persistence
            .run_transaction("drop", |state| {
                state
                    .remote_documents
                    .remove_entry(&DocumentKey::from_string("items/d000").unwrap());
                Ok(())
            })
            .unwrap();
        let results = persistence
            .run_transaction("query", |state| {
                Ok(engine.get_documents_matching_query(
                    state,
                    &query,
                    SnapshotVersion::new(crate::firestore::model::Timestamp::new(1, 0)),
                    &remote_keys,
                ))
            })
            .unwrap();
        let keys: Vec<String> = results.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["items/d001", "items/d002"]);
    }

    #[test]
    fn previous_results_plus_changes_match_a_full_scan() {
        let mut persistence = seeded(20);
        let engine = QueryEngine::default();
        let query = n_query(FilterOperator::GreaterThanOrEqual, 15);
        let synced_at = SnapshotVersion::new(crate::firestore::model::Timestamp::new(1, 0));
        let remote_keys: BTreeSet<DocumentKey> = (15..20)
            .map(|i| DocumentKey::from_string(&format!("items/d{i:03}")).unwrap())
            .collect();

        let n_field = |n: i64| {
            let mut fields = std::collections::BTreeMap::new();
            fields.insert("n".to_string(), FirestoreValue::from_integer(n));
            MapValue::new(fields)
        };
        persistence
            .run_transaction("changes since the target was synced", |state| {
                let newer = doc("items/d020", 2, 20);
                state.remote_documents.add_entry(&newer, newer.version());

                let local_only = DocumentKey::from_string("items/local").unwrap();
                let moved_out = DocumentKey::from_string("items/d016").unwrap();
                let mut overlays = std::collections::BTreeMap::new();
                overlays.insert(local_only.clone(), Some(Mutation::set(local_only, n_field(99))));
                overlays.insert(
                    moved_out.clone(),
                    Some(Mutation::patch(
                        moved_out,
                        n_field(0),
                        FieldMask::new([FieldPath::from_dot_separated("n").unwrap()]),
                    )),
                );
                state.document_overlays.save_overlays(1, overlays);
                Ok(())
            })
            .unwrap();

        let state = persistence.state();
        let incremental = engine
            .perform_query_using_remote_keys(state, &query, synced_at, &remote_keys)
            .unwrap();
        let mut context = QueryContext::default();
        let full_scan = local_documents_view::get_documents_matching_query(
            state,
            &query,
            SnapshotVersion::min(),
            &mut context,
        );
        assert_eq!(
            incremental.keys().collect::<BTreeSet<_>>(),
            full_scan.keys().collect::<BTreeSet<_>>()
        );
        let keys: Vec<String> = incremental.keys().map(|key| key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["items/d015", "items/d017", "items/d018", "items/d019", "items/d020", "items/local"]
        );
    }
}
