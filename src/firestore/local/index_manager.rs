use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound as RangeBound;

use crate::firestore::core::query::{FilterOperator, Query};
use crate::firestore::local::table::{JournaledTable, Table};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{compare_values, FirestoreValue};

/// Index value ordered by the cross-type value ordering.
#[derive(Clone, Debug)]
struct IndexValue(FirestoreValue);

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

type IndexEntry = (IndexValue, DocumentKey);

/// Identity of a single-field index: collection group plus field.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldIndexKey {
    pub collection_group: String,
    pub field: FieldPath,
}

/// Collection parent index plus the auto-created single-field indexes.
///
/// Field indexes live in memory only. They index remote documents and are used as a
/// superset filter, so after a rolled back transaction they are dropped rather than
/// risking missing entries.
pub struct IndexManager {
    collection_parents: Table<(String, ResourcePath), ()>,
    field_indexes: BTreeMap<FieldIndexKey, BTreeSet<IndexEntry>>,
}

impl IndexManager {
    pub(crate) fn new() -> Self {
        Self {
            collection_parents: Table::new("collection_parents"),
            field_indexes: BTreeMap::new(),
        }
    }

    /// Records `collection_path` (and its ancestors) under their collection ids.
    pub fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let mut path = collection_path.clone();
        while let Some(collection_id) = path.last_segment().map(str::to_string) {
            let parent = path.without_last();
            let row = (collection_id, parent.clone());
            if !self.collection_parents.contains_key(&row) {
                self.collection_parents.insert(row, ());
            }
            if parent.is_empty() {
                break;
            }
            path = parent.without_last();
        }
    }

    pub fn collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .range((collection_id.to_string(), ResourcePath::root())..)
            .take_while(|((id, _), _)| id == collection_id)
            .map(|((_, parent), _)| parent.clone())
            .collect()
    }

    pub fn has_field_index(&self, collection_group: &str, field: &FieldPath) -> bool {
        self.field_indexes.contains_key(&FieldIndexKey {
            collection_group: collection_group.to_string(),
            field: field.clone(),
        })
    }

    pub fn field_indexes(&self) -> impl Iterator<Item = &FieldIndexKey> {
        self.field_indexes.keys()
    }

    /// Creates an empty index; the caller backfills it with [`IndexManager::update_document`].
    pub(crate) fn create_field_index(&mut self, collection_group: &str, field: FieldPath) -> bool {
        let key = FieldIndexKey {
            collection_group: collection_group.to_string(),
            field,
        };
        if self.field_indexes.contains_key(&key) {
            return false;
        }
        log::debug!(
            "firestore: creating index on {}.{}",
            key.collection_group,
            key.field
        );
        self.field_indexes.insert(key, BTreeSet::new());
        true
    }

    pub(crate) fn invalidate_field_indexes(&mut self) {
        if !self.field_indexes.is_empty() {
            log::debug!("firestore: dropping {} field indexes", self.field_indexes.len());
        }
        self.field_indexes.clear();
    }

    /// Replaces the entries of `key` with those derived from `document`.
    pub(crate) fn update_document(&mut self, key: &DocumentKey, previous: Option<&Document>, document: Option<&Document>) {
        let group = key.collection_group().to_string();
        for (index_key, entries) in self.field_indexes.iter_mut() {
            if index_key.collection_group != group {
                continue;
            }
            if let Some(value) = previous.and_then(|doc| doc.field(&index_key.field)) {
                entries.remove(&(IndexValue(value.clone()), key.clone()));
            }
            if let Some(value) = document
                .filter(|doc| doc.is_found_document())
                .and_then(|doc| doc.field(&index_key.field))
            {
                entries.insert((IndexValue(value.clone()), key.clone()));
            }
        }
    }

    /// Keys that may match `query`, or `None` when no index serves it.
    ///
    /// The result is a superset; callers still evaluate the query on each document.
    pub fn candidate_keys(&self, query: &Query) -> Option<BTreeSet<DocumentKey>> {
        let group = query
            .collection_group_id()
            .or_else(|| query.path().last_segment())?;
        if query.is_document_query() {
            return None;
        }
        for filter in query.filters() {
            let index_key = FieldIndexKey {
                collection_group: group.to_string(),
                field: filter.field().clone(),
            };
            let Some(entries) = self.field_indexes.get(&index_key) else {
                continue;
            };
            let operands: Vec<&FirestoreValue> = match filter.operator() {
                FilterOperator::In => filter
                    .value()
                    .as_array()
                    .map(|array| array.values().iter().collect())
                    .unwrap_or_default(),
                FilterOperator::Equal
                | FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual => vec![filter.value()],
                _ => continue,
            };
            let mut keys = BTreeSet::new();
            for operand in operands {
                keys.extend(scan(entries, filter.operator(), operand));
            }
            return Some(keys);
        }
        None
    }

    pub(crate) fn tables_mut(&mut self) -> [&mut dyn JournaledTable; 1] {
        [&mut self.collection_parents]
    }
}

fn scan(entries: &BTreeSet<IndexEntry>, operator: FilterOperator, operand: &FirestoreValue) -> Vec<DocumentKey> {
    let value = IndexValue(operand.clone());
    let low = (value.clone(), DocumentKey::min_key());
    let range: (RangeBound<IndexEntry>, RangeBound<IndexEntry>) = match operator {
        FilterOperator::LessThan => (RangeBound::Unbounded, RangeBound::Excluded(low)),
        FilterOperator::GreaterThan | FilterOperator::GreaterThanOrEqual => {
            (RangeBound::Included(low), RangeBound::Unbounded)
        }
        FilterOperator::LessThanOrEqual => {
            return entries
                .iter()
                .take_while(|(candidate, _)| *candidate <= value)
                .map(|(_, key)| key.clone())
                .collect();
        }
        _ => (RangeBound::Included(low), RangeBound::Unbounded),
    };
    entries
        .range(range)
        .filter(|(candidate, _)| operator != FilterOperator::GreaterThan || *candidate != value)
        .take_while(|(candidate, _)| {
            !matches!(operator, FilterOperator::Equal | FilterOperator::In) || *candidate == value
        })
        .map(|(_, key)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn doc(path: &str, n: i64) -> Document {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), FirestoreValue::from_integer(n));
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            MapValue::new(map),
        )
    }

    fn field() -> FieldPath {
        FieldPath::from_dot_separated("n").unwrap()
    }

    #[test]
    fn records_collection_parents_for_nested_paths() {
        let mut manager = IndexManager::new();
        manager.add_to_collection_parent_index(&ResourcePath::from_string("rooms/r1/messages").unwrap());
        assert_eq!(
            manager.collection_parents("messages"),
            vec![ResourcePath::from_string("rooms/r1").unwrap()]
        );
        assert_eq!(manager.collection_parents("rooms"), vec![ResourcePath::root()]);
    }

    #[test]
    fn range_lookups_return_supersets() {
        let mut manager = IndexManager::new();
        manager.create_field_index("rooms", field());
        for (path, n) in [("rooms/a", 1), ("rooms/b", 5), ("rooms/c", 9)] {
            let document = doc(path, n);
            manager.update_document(document.key(), None, Some(&document));
        }
        let query = |op, n| {
            Query::collection("rooms")
                .unwrap()
                .filter(field(), op, FirestoreValue::from_integer(n))
                .unwrap()
        };
        let keys = |op, n| manager.candidate_keys(&query(op, n)).unwrap().len();
        assert_eq!(keys(FilterOperator::Equal, 5), 1);
        assert_eq!(keys(FilterOperator::LessThan, 5), 1);
        assert_eq!(keys(FilterOperator::LessThanOrEqual, 5), 2);
        assert_eq!(keys(FilterOperator::GreaterThan, 5), 1);
        assert_eq!(keys(FilterOperator::GreaterThanOrEqual, 5), 2);
    }

    #[test]
    fn updates_replace_previous_entries() {
        let mut manager = IndexManager::new();
        manager.create_field_index("rooms", field());
        let before = doc("rooms/a", 1);
        let after = doc("rooms/a", 7);
        manager.update_document(before.key(), None, Some(&before));
        manager.update_document(after.key(), Some(&before), Some(&after));
        let query = Query::collection("rooms")
            .unwrap()
            .filter(field(), FilterOperator::Equal, FirestoreValue::from_integer(1))
            .unwrap();
        assert!(manager.candidate_keys(&query).unwrap().is_empty());
    }
}
