use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

pub(crate) const TYPE_KEY: &str = "__type__";
pub(crate) const VECTOR_TYPE: &str = "__vector__";
pub(crate) const VECTOR_VALUE_KEY: &str = "value";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Write-time transforms a caller can embed in user data.
///
/// Sentinels never reach the document cache: the user data parser turns them into
/// [`crate::firestore::model::FieldTransform`]s before a mutation is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SentinelValue {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(Box<FirestoreValue>),
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
    Sentinel(SentinelValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    /// Encodes a dense vector as a tagged map, ordered between arrays and maps.
    pub fn vector(values: Vec<f64>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(TYPE_KEY.to_string(), FirestoreValue::from_string(VECTOR_TYPE));
        fields.insert(
            VECTOR_VALUE_KEY.to_string(),
            FirestoreValue::from_array(values.into_iter().map(FirestoreValue::from_double).collect()),
        );
        Self::from_map(fields)
    }

    /// Sentinel that populates the field with the commit time of the write.
    pub fn server_timestamp() -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ServerTimestamp),
        }
    }

    /// Sentinel that unions the provided elements with an existing array field.
    pub fn array_union(elements: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)),
        }
    }

    /// Sentinel that removes the provided elements from an existing array field.
    pub fn array_remove(elements: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)),
        }
    }

    /// Sentinel that increments the targeted numeric field by `operand`.
    pub fn numeric_increment(operand: FirestoreValue) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::NumericIncrement(Box::new(operand))),
        }
    }

    /// Sentinel that removes the field in an update.
    pub fn delete_field() -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::Delete),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut ValueKind {
        &mut self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Double(value) => Some(value),
            ValueKind::Integer(value) => Some(value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Reference(path) => Some(path.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_vector(&self) -> bool {
        self.as_map()
            .and_then(|map| map.fields().get(TYPE_KEY))
            .and_then(FirestoreValue::as_str)
            == Some(VECTOR_TYPE)
    }

    /// Rough in-cache footprint used to size the remote document cache.
    pub fn estimated_byte_size(&self) -> usize {
        match &self.kind {
            ValueKind::Null | ValueKind::Boolean(_) => 4,
            ValueKind::Integer(_) | ValueKind::Double(_) => 8,
            ValueKind::Timestamp(_) | ValueKind::GeoPoint(_) => 16,
            ValueKind::String(value) => value.len() * 2,
            ValueKind::Bytes(bytes) => bytes.as_slice().len(),
            ValueKind::Reference(path) => path.len(),
            ValueKind::Array(array) => array.values().iter().map(Self::estimated_byte_size).sum(),
            ValueKind::Map(map) => map.estimated_byte_size(),
            ValueKind::Sentinel(_) => 0,
        }
    }
}

impl From<MapValue> for FirestoreValue {
    fn from(map: MapValue) -> Self {
        Self::from_map_value(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        assert_eq!(v.as_str(), Some("hello"));
        assert!(FirestoreValue::from_double(f64::NAN).is_nan());
        assert_eq!(FirestoreValue::from_integer(3).as_double(), Some(3.0));
    }

    #[test]
    fn vectors_are_tagged_maps() {
        let vector = FirestoreValue::vector(vec![1.0, 2.0]);
        assert!(vector.is_vector());
        assert!(!FirestoreValue::from_map(BTreeMap::new()).is_vector());
    }

    #[test]
    fn estimates_nested_sizes() {
        let mut fields = BTreeMap::new();
        fields.insert("ab".to_string(), FirestoreValue::from_string("xyz"));
        let value = FirestoreValue::from_map(fields);
        assert_eq!(value.estimated_byte_size(), 2 + 6);
    }
}
