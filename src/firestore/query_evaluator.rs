use std::borrow::Cow;
use std::cmp::Ordering;

use crate::firestore::core::query::{Bound, FieldFilter, FilterOperator, OrderBy, OrderDirection, Query};
use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{compare_values, type_order, values_equal, FirestoreValue};

/// Whether `document` belongs to the result set of `query`, ignoring limits.
pub(crate) fn query_matches(query: &Query, document: &Document) -> bool {
    document.is_found_document()
        && matches_path(query, document.key())
        && matches_order_by(query, document)
        && query
            .filters()
            .iter()
            .all(|filter| filter_matches(filter, document))
        && matches_bounds(query, document)
}

fn matches_path(query: &Query, key: &DocumentKey) -> bool {
    if let Some(group) = query.collection_group_id() {
        key.has_collection_id(group) && query.path().is_prefix_of(key.path())
    } else if query.is_document_query() {
        query.path() == key.path()
    } else {
        query.path().is_immediate_parent_of(key.path())
    }
}

// Documents missing an explicitly ordered field are excluded.
fn matches_order_by(query: &Query, document: &Document) -> bool {
    query
        .explicit_order_by()
        .iter()
        .all(|order| order.field().is_document_id() || document.field(order.field()).is_some())
}

fn matches_bounds(query: &Query, document: &Document) -> bool {
    let order_by = query.normalized_order_by();
    if let Some(bound) = query.start_bound() {
        let ordering = compare_bound_to_document(bound, &order_by, document);
        let before = if bound.inclusive() {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        };
        if !before {
            return false;
        }
    }
    if let Some(bound) = query.end_bound() {
        let ordering = compare_bound_to_document(bound, &order_by, document);
        let after = if bound.inclusive() {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        };
        if !after {
            return false;
        }
    }
    true
}

fn compare_bound_to_document(bound: &Bound, order_by: &[OrderBy], document: &Document) -> Ordering {
    for (position, order) in bound.position().iter().zip(order_by) {
        let ordering = if order.field().is_document_id() {
            match position.as_reference().and_then(|path| DocumentKey::from_string(path).ok()) {
                Some(key) => key.cmp(document.key()),
                None => Ordering::Equal,
            }
        } else {
            match document.field(order.field()) {
                Some(value) => compare_values(position, value),
                None => Ordering::Equal,
            }
        };
        let ordering = apply_direction(ordering, order.direction());
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

pub(crate) fn filter_matches(filter: &FieldFilter, document: &Document) -> bool {
    let Some(value) = field_value(document, filter.field()) else {
        return false;
    };
    let operand = filter.value();
    match filter.operator() {
        FilterOperator::ArrayContains => value
            .as_array()
            .map(|array| array.contains(operand))
            .unwrap_or(false),
        FilterOperator::ArrayContainsAny => match (value.as_array(), operand.as_array()) {
            (Some(array), Some(needles)) => needles.values().iter().any(|needle| array.contains(needle)),
            _ => false,
        },
        FilterOperator::In => operand
            .as_array()
            .map(|candidates| candidates.values().iter().any(|candidate| values_equal(candidate, &value)))
            .unwrap_or(false),
        FilterOperator::NotIn => {
            let Some(candidates) = operand.as_array() else {
                return false;
            };
            if candidates.values().iter().any(FirestoreValue::is_null) {
                return false;
            }
            !value.is_null()
                && !candidates
                    .values()
                    .iter()
                    .any(|candidate| values_equal(candidate, &value))
        }
        FilterOperator::NotEqual => {
            !value.is_null() && compare_values(&value, operand) != Ordering::Equal
        }
        operator => {
            // Range and equality comparisons only apply within one type class.
            if type_order(&value) != type_order(operand) {
                return false;
            }
            let ordering = compare_values(&value, operand);
            match operator {
                FilterOperator::LessThan => ordering == Ordering::Less,
                FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
                FilterOperator::Equal => ordering == Ordering::Equal,
                FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                FilterOperator::GreaterThan => ordering == Ordering::Greater,
                _ => false,
            }
        }
    }
}

/// Sorts documents by `order_by`; the final clause is always the document key.
pub(crate) fn compare_documents(order_by: &[OrderBy], left: &Document, right: &Document) -> Ordering {
    for order in order_by {
        let ordering = if order.field().is_document_id() {
            left.key().cmp(right.key())
        } else {
            match (left.field(order.field()), right.field(order.field())) {
                (Some(l), Some(r)) => compare_values(l, r),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        let ordering = apply_direction(ordering, order.direction());
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.key().cmp(right.key())
}

fn apply_direction(ordering: Ordering, direction: OrderDirection) -> Ordering {
    match direction {
        OrderDirection::Ascending => ordering,
        OrderDirection::Descending => ordering.reverse(),
    }
}

pub(crate) fn field_value<'a>(document: &'a Document, field: &FieldPath) -> Option<Cow<'a, FirestoreValue>> {
    if field.is_document_id() {
        return Some(Cow::Owned(document_key_value(document.key())));
    }
    document.field(field).map(Cow::Borrowed)
}

pub(crate) fn document_key_value(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;
    use std::collections::BTreeMap;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, fields: Vec<(&str, FirestoreValue)>) -> Document {
        let map: BTreeMap<String, FirestoreValue> =
            fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            MapValue::new(map),
        )
    }

    #[test]
    fn matches_only_direct_children() {
        let query = Query::collection("cities").unwrap();
        assert!(query_matches(&query, &doc("cities/sf", vec![])));
        assert!(!query_matches(&query, &doc("cities/sf/parks/p1", vec![])));
        assert!(!query_matches(&query, &doc("towns/sf", vec![])));
    }

    #[test]
    fn collection_group_matches_any_depth() {
        let query = Query::collection_group("parks").unwrap();
        assert!(query_matches(&query, &doc("cities/sf/parks/p1", vec![])));
        assert!(query_matches(&query, &doc("parks/p2", vec![])));
        assert!(!query_matches(&query, &doc("cities/sf", vec![])));
    }

    #[test]
    fn range_filters_respect_type_classes() {
        let query = Query::collection("cities")
            .unwrap()
            .filter(field("pop"), FilterOperator::GreaterThan, FirestoreValue::from_integer(10))
            .unwrap();
        assert!(query_matches(&query, &doc("cities/a", vec![("pop", FirestoreValue::from_double(10.5))])));
        assert!(!query_matches(&query, &doc("cities/b", vec![("pop", FirestoreValue::from_string("zz"))])));
        assert!(!query_matches(&query, &doc("cities/c", vec![])));
    }

    #[test]
    fn not_in_excludes_null_and_missing() {
        let query = Query::collection("cities")
            .unwrap()
            .filter(
                field("state"),
                FilterOperator::NotIn,
                FirestoreValue::from_array(vec![FirestoreValue::from_string("CA")]),
            )
            .unwrap();
        assert!(query_matches(&query, &doc("cities/a", vec![("state", FirestoreValue::from_string("NY"))])));
        assert!(!query_matches(&query, &doc("cities/b", vec![("state", FirestoreValue::null())])));
        assert!(!query_matches(&query, &doc("cities/c", vec![])));
    }

    #[test]
    fn array_contains_any_matches_overlap() {
        let query = Query::collection("cities")
            .unwrap()
            .filter(
                field("tags"),
                FilterOperator::ArrayContainsAny,
                FirestoreValue::from_array(vec![FirestoreValue::from_string("coast")]),
            )
            .unwrap();
        let tagged = doc(
            "cities/a",
            vec![(
                "tags",
                FirestoreValue::from_array(vec![
                    FirestoreValue::from_string("hills"),
                    FirestoreValue::from_string("coast"),
                ]),
            )],
        );
        assert!(query_matches(&query, &tagged));
    }

    #[test]
    fn bounds_follow_order_by() {
        let query = Query::collection("cities")
            .unwrap()
            .order_by(field("pop"), OrderDirection::Ascending)
            .unwrap()
            .start_after(vec![FirestoreValue::from_integer(5)])
            .unwrap()
            .end_at(vec![FirestoreValue::from_integer(9)])
            .unwrap();
        let at = |n| doc("cities/x", vec![("pop", FirestoreValue::from_integer(n))]);
        assert!(!query_matches(&query, &at(5)));
        assert!(query_matches(&query, &at(6)));
        assert!(query_matches(&query, &at(9)));
        assert!(!query_matches(&query, &at(10)));
    }

    #[test]
    fn missing_order_by_field_excludes_document() {
        let query = Query::collection("cities")
            .unwrap()
            .order_by(field("pop"), OrderDirection::Descending)
            .unwrap();
        assert!(!query_matches(&query, &doc("cities/a", vec![])));
    }
}
