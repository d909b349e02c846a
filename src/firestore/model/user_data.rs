//! Turns caller supplied field maps into mutations.
//!
//! Sentinel values (`server_timestamp()`, `array_union(..)`, `delete_field()`, ...) are
//! stripped from the data and become field transforms or masked deletes.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, Precondition, TransformOperation,
};
use crate::firestore::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Merge the provided fields into the existing document.
    pub merge: bool,
    /// Merge only these fields; takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let unique: Vec<FieldPath> = fields
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Err(invalid_argument("merge_fields requires at least one field path"));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

#[derive(Default)]
struct ParsedData {
    data: BTreeMap<String, FirestoreValue>,
    transforms: Vec<FieldTransform>,
    deletes: Vec<FieldPath>,
    leaf_paths: Vec<FieldPath>,
}

/// Builds a set (or merging patch) mutation for `key`.
pub fn parse_set_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<Mutation> {
    let parsed = parse_fields(&data, &[])?;
    if !options.is_merge() {
        if !parsed.deletes.is_empty() {
            return Err(invalid_argument(
                "delete_field() can only be used with update or merge writes",
            ));
        }
        return Ok(Mutation::Set {
            key,
            value: MapValue::new(parsed.data),
            precondition: Precondition::None,
            field_transforms: parsed.transforms,
        });
    }

    let mut available: BTreeSet<FieldPath> = parsed.leaf_paths.iter().cloned().collect();
    available.extend(parsed.deletes.iter().cloned());
    available.extend(parsed.transforms.iter().map(|t| t.field_path().clone()));

    let (mask, transforms) = match &options.merge_fields {
        Some(fields) => {
            for field in fields {
                if !available.iter().any(|path| field.is_prefix_of(path)) {
                    return Err(invalid_argument(format!(
                        "Field '{field}' is specified in merge_fields but missing from the provided data"
                    )));
                }
            }
            let transforms = parsed
                .transforms
                .into_iter()
                .filter(|t| fields.iter().any(|f| f.is_prefix_of(t.field_path())))
                .collect::<Vec<_>>();
            (FieldMask::new(fields.iter().cloned()), transforms)
        }
        None => {
            let data_paths = parsed.leaf_paths.iter().chain(parsed.deletes.iter()).cloned();
            (FieldMask::new(data_paths), parsed.transforms)
        }
    };

    Ok(Mutation::Patch {
        key,
        data: MapValue::new(parsed.data),
        field_mask: mask,
        precondition: Precondition::None,
        field_transforms: transforms,
    })
}

/// Builds an update mutation; the document must already exist.
pub fn parse_update_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
) -> FirestoreResult<Mutation> {
    let parsed = parse_fields(&data, &[])?;
    if parsed.leaf_paths.is_empty() && parsed.transforms.is_empty() && parsed.deletes.is_empty() {
        return Err(invalid_argument("update requires at least one field/value pair"));
    }
    let mask = FieldMask::new(parsed.leaf_paths.into_iter().chain(parsed.deletes));
    Ok(Mutation::Patch {
        key,
        data: MapValue::new(parsed.data),
        field_mask: mask,
        precondition: Precondition::Exists(true),
        field_transforms: parsed.transforms,
    })
}

fn parse_fields(
    data: &BTreeMap<String, FirestoreValue>,
    parent: &[String],
) -> FirestoreResult<ParsedData> {
    let mut parsed = ParsedData::default();
    parsed.data = parse_map_into(data, parent, &mut parsed)?;
    Ok(parsed)
}

/// Walks one map level, collecting paths into `parsed` and returning the map
/// with every sentinel removed.
fn parse_map_into(
    data: &BTreeMap<String, FirestoreValue>,
    parent: &[String],
    parsed: &mut ParsedData,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut cleaned = BTreeMap::new();
    for (name, value) in data {
        let mut segments = parent.to_vec();
        segments.push(name.clone());
        let path = FieldPath::new(segments.clone())?;
        match value.kind() {
            ValueKind::Sentinel(SentinelValue::Delete) => parsed.deletes.push(path),
            ValueKind::Sentinel(sentinel) => {
                parsed.transforms.push(transform_from_sentinel(path, sentinel)?);
            }
            ValueKind::Map(map) if !map.is_empty() => {
                let nested = parse_map_into(map.fields(), &segments, parsed)?;
                if !nested.is_empty() {
                    cleaned.insert(name.clone(), FirestoreValue::from_map(nested));
                }
            }
            _ => {
                assert_no_sentinel(value, &path)?;
                cleaned.insert(name.clone(), value.clone());
                parsed.leaf_paths.push(path);
            }
        }
    }
    Ok(cleaned)
}

fn transform_from_sentinel(path: FieldPath, sentinel: &SentinelValue) -> FirestoreResult<FieldTransform> {
    let operation = match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            for element in elements {
                assert_no_sentinel(element, &path)?;
            }
            TransformOperation::ArrayUnion(elements.clone())
        }
        SentinelValue::ArrayRemove(elements) => {
            for element in elements {
                assert_no_sentinel(element, &path)?;
            }
            TransformOperation::ArrayRemove(elements.clone())
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(invalid_argument("increment() requires a numeric operand"));
            }
            TransformOperation::NumericIncrement(operand.as_ref().clone())
        }
        SentinelValue::Delete => {
            return Err(invalid_argument("delete_field() cannot be used as a transform"))
        }
    };
    Ok(FieldTransform::new(path, operation))
}

fn assert_no_sentinel(value: &FirestoreValue, context: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Sentinel values cannot be used inside arrays (field '{context}')"
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| assert_no_sentinel(element, context)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| assert_no_sentinel(element, context)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("orders/o1").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn set_extracts_transforms() {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), FirestoreValue::from_string("latte"));
        data.insert("updated".to_string(), FirestoreValue::server_timestamp());
        let mutation = parse_set_data(key(), data, &SetOptions::default()).unwrap();
        match mutation {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                assert_eq!(value.fields().len(), 1);
                assert_eq!(field_transforms.len(), 1);
                assert_eq!(field_transforms[0].field_path(), &path("updated"));
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn update_masks_nested_leaves_and_deletes() {
        let mut nested = BTreeMap::new();
        nested.insert("size".to_string(), FirestoreValue::from_string("tall"));
        nested.insert("syrup".to_string(), FirestoreValue::delete_field());
        let mut data = BTreeMap::new();
        data.insert("options".to_string(), FirestoreValue::from_map(nested));
        let mutation = parse_update_data(key(), data).unwrap();
        match mutation {
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                ..
            } => {
                assert_eq!(precondition, Precondition::Exists(true));
                assert!(field_mask.fields().contains(&path("options.size")));
                assert!(field_mask.fields().contains(&path("options.syrup")));
                assert_eq!(
                    data.field(&path("options.size")),
                    Some(&FirestoreValue::from_string("tall"))
                );
                assert!(data.field(&path("options.syrup")).is_none());
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn rejects_sentinels_inside_arrays() {
        let mut data = BTreeMap::new();
        data.insert(
            "list".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::server_timestamp()]),
        );
        let err = parse_set_data(key(), data, &SetOptions::default()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn merge_fields_must_exist_in_data() {
        let mut data = BTreeMap::new();
        data.insert("a".to_string(), FirestoreValue::from_integer(1));
        let options = SetOptions::merge_fields([path("b")]).unwrap();
        assert!(parse_set_data(key(), data, &options).is_err());
    }
}
