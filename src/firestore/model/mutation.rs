use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::firestore::value::server_timestamp::server_timestamp_value;
use crate::firestore::value::{values_equal, FirestoreValue, MapValue, ValueKind};

/// Condition the backend checks before applying a mutation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(true) => document.is_found_document(),
            Precondition::Exists(false) => document.is_no_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` equals or is nested below a masked field.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<'a>(mut self, other: impl IntoIterator<Item = &'a FieldPath>) -> Self {
        self.fields.extend(other.into_iter().cloned());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                server_timestamp_value(local_write_time, previous)
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    /// Transforms are not idempotent when replaying them changes the outcome.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Outcome of one mutation as reported by the write stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// A single write against one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patch that only applies to an existing document.
    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Fields this mutation touches; `None` means the whole document is replaced.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch { field_mask, .. } => Some(field_mask.clone()),
            _ => None,
        }
    }

    /// Applies the mutation to the locally cached view of `document`.
    ///
    /// `previous_mask` is the set of fields already overwritten by earlier pending
    /// mutations (`None` for a full overwrite); the returned mask includes this
    /// mutation's fields.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let mut data = value.clone();
                apply_local_transforms(&mut data, document, field_transforms, local_write_time);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                field_mask,
                field_transforms,
                ..
            } => {
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, data, field_mask);
                apply_local_transforms(&mut new_data, document, field_transforms, local_write_time);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union_with(field_mask.fields())
                        .union_with(field_transforms.iter().map(FieldTransform::field_path))
                })
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the mutation using the backend's acknowledgement.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let mut data = value.clone();
                apply_server_transforms(&mut data, document, field_transforms, result);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The backend accepted a write we cannot reproduce locally.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, data, field_mask);
                apply_server_transforms(&mut new_data, document, field_transforms, result);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }
}

/// Squashes the pending local state of `document` into a single mutation.
///
/// `mask` is the accumulated field mask returned by `apply_to_local_view`; `None`
/// means the document was fully overwritten and a set or delete is produced.
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };
    if mask.is_empty() {
        return None;
    }

    let mut patch = MapValue::empty();
    let mut mask_set = BTreeSet::new();
    for field in mask.fields() {
        if mask_set.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = document.field(&path);
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = document.field(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set_field(&path, value.clone()),
            None => patch.delete_field(&path),
        }
        mask_set.insert(path);
    }
    Some(Mutation::Patch {
        key: document.key().clone(),
        data: patch,
        field_mask: FieldMask::new(mask_set),
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}

fn apply_patch(target: &mut MapValue, patch: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match patch.field(path) {
            Some(value) => target.set_field(path, value.clone()),
            None => target.delete_field(path),
        }
    }
}

fn apply_local_transforms(
    data: &mut MapValue,
    base: &Document,
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
) {
    for transform in transforms {
        let previous = base.field(transform.field_path());
        let value = transform
            .operation()
            .apply_to_local_view(previous, local_write_time);
        data.set_field(transform.field_path(), value);
    }
}

fn apply_server_transforms(
    data: &mut MapValue,
    base: &Document,
    transforms: &[FieldTransform],
    result: &MutationResult,
) {
    for (index, transform) in transforms.iter().enumerate() {
        let value = match result.transform_results.get(index) {
            Some(value) => value.clone(),
            None => {
                log::debug!(
                    "missing server transform result for field {}, computing locally",
                    transform.field_path()
                );
                match transform.operation() {
                    TransformOperation::ServerTimestamp => {
                        FirestoreValue::from_timestamp(result.version.timestamp())
                    }
                    operation => operation.apply_to_local_view(
                        base.field(transform.field_path()),
                        result.version.timestamp(),
                    ),
                }
            }
        };
        data.set_field(transform.field_path(), value);
    }
}

fn array_elements(existing: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = array_elements(existing);
    for element in additions {
        if !values.iter().any(|candidate| values_equal(candidate, element)) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = array_elements(existing)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| values_equal(needle, candidate)))
        .collect();
    FirestoreValue::from_array(values)
}

/// Non-numeric base values count as zero; integer overflow falls back to doubles.
fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = existing
        .filter(|value| value.is_number())
        .cloned()
        .unwrap_or_else(|| FirestoreValue::from_integer(0));
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*current as f64 + *delta as f64),
        },
        _ => FirestoreValue::from_double(
            base.as_double().unwrap_or(0.0) + operand.as_double().unwrap_or(0.0),
        ),
    }
}
