//! Local views of documents: remote state with pending overlays folded in.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::local::persistence::PersistedState;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, FieldMask, Mutation, Overlay,
    SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// A local view plus the fields its pending writes touched (`None` = whole document).
#[derive(Clone, Debug)]
pub struct OverlayedDocument {
    pub document: Document,
    pub mutated_fields: Option<FieldMask>,
}

fn apply_overlay(document: &mut Document, overlay: &Overlay) -> Option<FieldMask> {
    overlay
        .mutation
        .apply_to_local_view(document, overlay.mutation.field_mask(), Timestamp::now())
}

pub(crate) fn get_document(state: &PersistedState, key: &DocumentKey) -> Document {
    let mut document = state.remote_documents.get_entry(key);
    if let Some(overlay) = state.document_overlays.get_overlay(key) {
        apply_overlay(&mut document, &overlay);
    }
    document
}

/// Local views of `keys`; keys with no cached state map to invalid documents.
pub(crate) fn get_documents<'a, I>(state: &PersistedState, keys: I) -> BTreeMap<DocumentKey, Document>
where
    I: IntoIterator<Item = &'a DocumentKey>,
{
    keys.into_iter()
        .map(|key| (key.clone(), get_document(state, key)))
        .collect()
}

/// Folds overlays into `documents`.
///
/// Documents whose existence changed under a patch overlay get their overlays
/// recalculated, since a patch over a now-missing base no longer produces a document.
pub(crate) fn get_overlayed_documents(
    state: &mut PersistedState,
    documents: BTreeMap<DocumentKey, Document>,
    existence_changed: &BTreeSet<DocumentKey>,
) -> BTreeMap<DocumentKey, OverlayedDocument> {
    let overlays = state.document_overlays.get_overlays(documents.keys());
    let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let mut recalculate: BTreeMap<DocumentKey, Document> = BTreeMap::new();
    let mut results: BTreeMap<DocumentKey, Document> = BTreeMap::new();

    for (key, mut document) in documents {
        let overlay = overlays.get(&key);
        let is_patch = matches!(overlay.map(|o| &o.mutation), Some(Mutation::Patch { .. }));
        if existence_changed.contains(&key) && (overlay.is_none() || is_patch) {
            recalculate.insert(key, document);
        } else if let Some(overlay) = overlay {
            mutated_fields.insert(key.clone(), overlay.mutation.field_mask());
            apply_overlay(&mut document, overlay);
            results.insert(key, document);
        } else {
            mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            results.insert(key, document);
        }
    }

    let recalculated = recalculate_overlays_for_documents(state, &mut recalculate);
    mutated_fields.extend(recalculated);
    results.extend(recalculate);

    results
        .into_iter()
        .map(|(key, document)| {
            let mutated_fields = mutated_fields.get(&key).cloned().flatten();
            (key, OverlayedDocument { document, mutated_fields })
        })
        .collect()
}

/// Rebuilds and saves the overlays of `keys` from the remote state and the queue.
pub(crate) fn recalculate_and_save_overlays(
    state: &mut PersistedState,
    keys: &BTreeSet<DocumentKey>,
) -> BTreeMap<DocumentKey, Option<FieldMask>> {
    let mut documents = state.remote_documents.get_entries(keys);
    recalculate_overlays_for_documents(state, &mut documents)
}

/// Replays every pending batch onto `documents` (in place) and saves one overlay per
/// key, tagged with the largest batch that touched it.
fn recalculate_overlays_for_documents(
    state: &mut PersistedState,
    documents: &mut BTreeMap<DocumentKey, Document>,
) -> BTreeMap<DocumentKey, Option<FieldMask>> {
    let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let mut largest_batch: BTreeMap<DocumentKey, BatchId> = BTreeMap::new();

    let batches = state
        .mutation_queue
        .all_mutation_batches_affecting_document_keys(documents.keys());
    for batch in &batches {
        for key in batch.keys() {
            let Some(document) = documents.get_mut(&key) else {
                continue;
            };
            let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
            masks.insert(key.clone(), batch.apply_to_local_view(document, mask));
            largest_batch.insert(key, batch.batch_id);
        }
    }

    let mut by_batch: BTreeMap<BatchId, BTreeMap<DocumentKey, Option<Mutation>>> = BTreeMap::new();
    for key in documents.keys() {
        let batch_id = largest_batch.get(key).copied().unwrap_or(BATCH_ID_UNKNOWN);
        let mutation = match (documents.get(key), masks.get(key)) {
            (Some(document), Some(mask)) => calculate_overlay_mutation(document, mask.as_ref()),
            _ => None,
        };
        by_batch.entry(batch_id).or_default().insert(key.clone(), mutation);
    }
    for (batch_id, overlays) in by_batch {
        state.document_overlays.save_overlays(batch_id, overlays);
    }
    masks
}

/// Local views of documents matching `query` (ignoring limits).
///
/// Remote documents read at or before `since_read_time` are skipped; documents with
/// overlays are always considered.
pub(crate) fn get_documents_matching_query(
    state: &PersistedState,
    query: &Query,
    since_read_time: SnapshotVersion,
    context: &mut QueryContext,
) -> BTreeMap<DocumentKey, Document> {
    if query.is_document_query() {
        let mut results = BTreeMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = get_document(state, &key);
            context.documents_read_count += 1;
            if document.is_found_document() {
                results.insert(key, document);
            }
        }
        return results;
    }

    if let Some(group) = query.collection_group_id() {
        let mut results = BTreeMap::new();
        for parent in state.remote_documents.index_manager().collection_parents(group) {
            let collection_query = query.as_collection_query_at_path(parent.child([group]));
            results.extend(get_documents_matching_collection_query(
                state,
                &collection_query,
                since_read_time,
                context,
            ));
        }
        return results;
    }

    get_documents_matching_collection_query(state, query, since_read_time, context)
}

fn get_documents_matching_collection_query(
    state: &PersistedState,
    query: &Query,
    since_read_time: SnapshotVersion,
    context: &mut QueryContext,
) -> BTreeMap<DocumentKey, Document> {
    let overlays = state
        .document_overlays
        .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN);
    let (mut documents, read) = state
        .remote_documents
        .get_documents_in_collection(query.path(), since_read_time);
    context.documents_read_count += read;
    fold_and_filter(query, &mut documents, &overlays)
}

/// Local views of `candidates` plus every overlaid document in the query's collections.
pub(crate) fn get_documents_matching_candidates(
    state: &PersistedState,
    query: &Query,
    candidates: &BTreeSet<DocumentKey>,
) -> BTreeMap<DocumentKey, Document> {
    let mut overlays = BTreeMap::new();
    match query.collection_group_id() {
        Some(group) => {
            for parent in state.remote_documents.index_manager().collection_parents(group) {
                overlays.extend(
                    state
                        .document_overlays
                        .get_overlays_for_collection(&parent.child([group]), BATCH_ID_UNKNOWN),
                );
            }
        }
        None => overlays.extend(
            state
                .document_overlays
                .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN),
        ),
    }
    let mut documents = state.remote_documents.get_entries(candidates);
    fold_and_filter(query, &mut documents, &overlays)
}

fn fold_and_filter(
    query: &Query,
    documents: &mut BTreeMap<DocumentKey, Document>,
    overlays: &BTreeMap<DocumentKey, Overlay>,
) -> BTreeMap<DocumentKey, Document> {
    for key in overlays.keys() {
        if !documents.contains_key(key) {
            documents.insert(key.clone(), Document::new_invalid_document(key.clone()));
        }
    }
    let mut results = BTreeMap::new();
    for (key, document) in documents.iter_mut() {
        if let Some(overlay) = overlays.get(key) {
            apply_overlay(document, overlay);
        }
        if query.matches(document) {
            results.insert(key.clone(), document.clone());
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::credentials::User;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::model::{FieldPath, MutationBatch};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        MapValue::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), FirestoreValue::from_integer(*v)))
                .collect(),
        )
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    fn refold_from_scratch(state: &PersistedState) -> Document {
        let mut document = state.remote_documents.get_entry(&key());
        let mut mask = Some(FieldMask::empty());
        for batch in state.mutation_queue.all_mutation_batches_affecting_document_key(&key()) {
            mask = batch.apply_to_local_view(&mut document, mask);
        }
        document
    }

    fn write(state: &mut PersistedState, mutation: Mutation) -> MutationBatch {
        let batch = state
            .mutation_queue
            .add_mutation_batch(Timestamp::now(), vec![mutation]);
        let keys: BTreeSet<DocumentKey> = batch.keys();
        recalculate_and_save_overlays(state, &keys);
        batch
    }

    #[test]
    fn overlay_equals_refolding_the_queue() {
        let mut persistence = Persistence::memory(&User::unauthenticated());
        persistence
            .run_transaction("writes", |state| {
                write(state, Mutation::set(key(), map(&[("x", 1)])));
                write(
                    state,
                    Mutation::patch(key(), map(&[("y", 2)]), FieldMask::new([field("y")])),
                );
                Ok(())
            })
            .unwrap();

        let state = persistence.state();
        let folded = get_document(state, &key());
        let refolded = refold_from_scratch(state);
        assert_eq!(folded.data(), refolded.data());
        assert_eq!(folded.data(), &map(&[("x", 1), ("y", 2)]));
        assert!(folded.has_local_mutations());
    }

    #[test]
    fn matching_query_includes_overlay_only_documents() {
        let mut persistence = Persistence::memory(&User::unauthenticated());
        persistence
            .run_transaction("write", |state| {
                write(state, Mutation::set(key(), map(&[("x", 1)])));
                Ok(())
            })
            .unwrap();
        let query = Query::collection("rooms").unwrap();
        let mut context = QueryContext::default();
        let results = get_documents_matching_query(
            persistence.state(),
            &query,
            SnapshotVersion::min(),
            &mut context,
        );
        assert_eq!(results.len(), 1);
        assert!(results[&key()].has_local_mutations());
    }
}
