use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::query_evaluator;
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn requires_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if operator.requires_array_operand() {
            match value.as_array() {
                Some(array) if !array.values().is_empty() => {}
                _ => {
                    return Err(invalid_argument(format!(
                        "'{}' filters require a non-empty array operand",
                        operator.as_str()
                    )))
                }
            }
        }
        if matches!(value.kind(), ValueKind::Sentinel(_)) {
            return Err(invalid_argument("Filters cannot compare against sentinel values"));
        }
        if field.is_document_id() && value.as_reference().is_none() && !operator.requires_array_operand() {
            return Err(invalid_argument(
                "Filters on the document id must compare against a document reference",
            ));
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &Document) -> bool {
        query_evaluator::filter_matches(self, document)
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_value(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    fn reversed(self) -> Self {
        match self {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    fn canonical_id(&self) -> String {
        let direction = match self.direction {
            OrderDirection::Ascending => "asc",
            OrderDirection::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// A cursor position along the query's order by clauses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn canonical_id(&self) -> String {
        let mut out = String::from(if self.inclusive { "b:" } else { "a:" });
        let values: Vec<String> = self.position.iter().map(canonical_value).collect();
        out.push_str(&values.join(","));
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// What the backend is asked to watch. Limit-to-last queries are flipped into a
/// limit-to-first target with reversed ordering and swapped bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        self.collection_group.is_none() && self.path.len() % 2 == 0 && self.filters.is_empty()
    }

    /// Stable textual identity used to deduplicate targets.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        if let Some(bound) = &self.start_at {
            let _ = write!(id, "|lb:{}", bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            let _ = write!(id, "|ub:{}", bound.canonical_id());
        }
        id
    }
}

/// A query against the local cache and the watch backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    fn at_path(path: ResourcePath, collection_group: Option<String>) -> Self {
        Self {
            path,
            collection_group,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Query over the documents directly inside `path`.
    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(
                "Queries must reference a collection (odd number of path segments)",
            ));
        }
        Ok(Self::at_path(path, None))
    }

    /// Query over every collection named `collection_id`, at any depth.
    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(
                "Collection group ids must be a single non-empty path segment",
            ));
        }
        Ok(Self::at_path(ResourcePath::root(), Some(collection_id)))
    }

    /// Query matching exactly one document.
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone(), None)
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> FirestoreResult<Self> {
        if self.is_document_query() {
            return Err(invalid_argument("Single document queries cannot be filtered"));
        }
        self.filters.push(filter);
        Ok(self)
    }

    pub fn filter(
        self,
        field: FieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let filter = FieldFilter::new(field, operator, value)?;
        self.with_filter(filter)
    }

    pub fn order_by(mut self, field: FieldPath, direction: OrderDirection) -> FirestoreResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "order_by must be called before start/end cursors are set",
            ));
        }
        self.explicit_order_by.push(OrderBy::new(field, direction));
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: u32) -> FirestoreResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("limit must be positive"));
        }
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        Ok(self)
    }

    pub fn limit_to_last(mut self, limit: u32) -> FirestoreResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("limit must be positive"));
        }
        if self.explicit_order_by.is_empty() {
            return Err(invalid_argument(
                "limit_to_last requires at least one order_by clause",
            ));
        }
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        Ok(self)
    }

    pub fn start_at(self, position: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_start(Bound::new(position, true))
    }

    pub fn start_after(self, position: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_start(Bound::new(position, false))
    }

    pub fn end_at(self, position: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_end(Bound::new(position, true))
    }

    pub fn end_before(self, position: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_end(Bound::new(position, false))
    }

    fn with_start(mut self, bound: Bound) -> FirestoreResult<Self> {
        self.check_bound(&bound)?;
        self.start_at = Some(bound);
        Ok(self)
    }

    fn with_end(mut self, bound: Bound) -> FirestoreResult<Self> {
        self.check_bound(&bound)?;
        self.end_at = Some(bound);
        Ok(self)
    }

    fn check_bound(&self, bound: &Bound) -> FirestoreResult<()> {
        if bound.position.is_empty() || bound.position.len() > self.normalized_order_by().len() {
            return Err(invalid_argument(
                "Cursor position must have between one value and one value per order_by clause",
            ));
        }
        Ok(())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        self.collection_group.is_none() && self.path.len() % 2 == 0 && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when every document in the collection is part of the result.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_document_id()))
    }

    /// Explicit clauses, then inequality fields, then the document key tiebreaker.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let last_direction = order_by
            .last()
            .map(|order| order.direction)
            .unwrap_or(OrderDirection::Ascending);

        let mut inequality_fields: Vec<FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.operator.is_inequality())
            .map(|filter| filter.field.clone())
            .collect();
        inequality_fields.sort();
        inequality_fields.dedup();
        for field in inequality_fields {
            if !field.is_document_id() && !order_by.iter().any(|order| order.field == field) {
                order_by.push(OrderBy::new(field, last_direction));
            }
        }

        if !order_by.iter().any(|order| order.field.is_document_id()) {
            order_by.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        order_by
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.reversed()))
                    .collect(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), !bound.inclusive)),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), !bound.inclusive)),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        // Built from the un-flipped form so first/last over the same clauses stay distinct.
        let first = Self {
            limit_type: LimitType::First,
            ..self.clone()
        };
        format!("{}|lt:{limit_type}", first.to_target().canonical_id())
    }

    /// Same query without the limit; used to re-run a view that lost its boundary.
    pub fn without_limit(&self) -> Self {
        Self {
            limit: None,
            limit_type: LimitType::First,
            ..self.clone()
        }
    }

    /// Copy of this query rooted at one concrete collection; used to fan out
    /// collection group queries.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        query_evaluator::query_matches(self, document)
    }

    /// Orders two documents the way the query's results are sorted.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        query_evaluator::compare_documents(&self.normalized_order_by(), left, right)
    }
}

pub(crate) fn canonical_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(value) => value.to_base64(),
        ValueKind::Reference(path) => path.clone(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => {
            let items: Vec<String> = array.values().iter().map(canonical_value).collect();
            format!("[{}]", items.join(","))
        }
        ValueKind::Map(map) => {
            let items: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_value(value)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        ValueKind::Sentinel(_) => "sentinel".to_string(),
    }
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

    fn doc(path: &str, n: i64) -> Document {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), FirestoreValue::from_integer(n));
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            MapValue::new(map),
        )
    }

    #[test]
    fn normalized_order_adds_inequality_and_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .filter(field("n"), FilterOperator::GreaterThan, FirestoreValue::from_integer(1))
            .unwrap();
        let order = query.normalized_order_by();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].field(), &field("n"));
        assert!(order[1].field().is_document_id());
    }

    #[test]
    fn canonical_ids_distinguish_limit_type() {
        let base = Query::collection("rooms")
            .unwrap()
            .order_by(field("n"), OrderDirection::Ascending)
            .unwrap();
        let first = base.clone().limit_to_first(2).unwrap();
        let last = base.limit_to_last(2).unwrap();
        assert_ne!(first.canonical_id(), last.canonical_id());
        assert_eq!(first.canonical_id(), first.clone().canonical_id());
    }

    #[test]
    fn limit_to_last_target_flips_ordering_and_bounds() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(field("n"), OrderDirection::Ascending)
            .unwrap()
            .start_at(vec![FirestoreValue::from_integer(3)])
            .unwrap()
            .limit_to_last(1)
            .unwrap();
        let target = query.to_target();
        assert_eq!(target.order_by()[0].direction(), OrderDirection::Descending);
        assert!(target.start_at().is_none());
        assert!(!target.end_at().unwrap().inclusive());
    }

    #[test]
    fn compare_orders_by_field_then_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(field("n"), OrderDirection::Ascending)
            .unwrap();
        assert_eq!(query.compare(&doc("rooms/b", 1), &doc("rooms/a", 2)), Ordering::Less);
        assert_eq!(query.compare(&doc("rooms/a", 1), &doc("rooms/b", 1)), Ordering::Less);
    }

    #[test]
    fn rejects_bad_filters() {
        assert!(FieldFilter::new(field("n"), FilterOperator::In, FirestoreValue::from_integer(1)).is_err());
        assert!(Query::collection("rooms/r1").is_err());
        assert!(Query::collection("rooms").unwrap().limit_to_last(1).is_err());
    }
}
