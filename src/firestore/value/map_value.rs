use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Field tree of a document, or the value of a nested map field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a nested field, walking through map values.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.fields.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing any non-map value found on the way.
    pub fn set_field(&mut self, path: &FieldPath, value: FirestoreValue) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map_value(MapValue::empty());
            }
            current = match entry.map_fields_mut() {
                Some(fields) => fields,
                None => return,
            };
        }
        current.insert(last.clone(), value);
    }

    /// Removes the field at `path`; missing parents are left untouched.
    pub fn delete_field(&mut self, path: &FieldPath) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            current = match current.get_mut(segment).and_then(FirestoreValue::map_fields_mut) {
                Some(fields) => fields,
                None => return,
            };
        }
        current.remove(last);
    }

    pub fn estimated_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() + value.estimated_byte_size())
            .sum()
    }
}

impl FirestoreValue {
    fn map_fields_mut(&mut self) -> Option<&mut BTreeMap<String, FirestoreValue>> {
        match self.kind_mut() {
            ValueKind::Map(map) => Some(&mut map.fields),
            _ => None,
        }
    }
}
