//! Total ordering and equality across Firestore value types.

use std::cmp::Ordering;

use crate::firestore::value::server_timestamp::{get_local_write_time, is_server_timestamp};
use crate::firestore::value::value::VECTOR_VALUE_KEY;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Cross-type ordering buckets; integers and doubles share the number bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    ServerTimestamp,
    String,
    Bytes,
    Reference,
    GeoPoint,
    Array,
    Vector,
    Map,
    Sentinel,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Bytes,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) if is_server_timestamp(value) => TypeOrder::ServerTimestamp,
        ValueKind::Map(_) if value.is_vector() => TypeOrder::Vector,
        ValueKind::Map(_) => TypeOrder::Map,
        ValueKind::Sentinel(_) => TypeOrder::Sentinel,
    }
}

pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l.split('/').cmp(r.split('/')),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => compare_arrays(l.values(), r.values()),
        (ValueKind::Map(l), ValueKind::Map(r)) => match left_order {
            TypeOrder::ServerTimestamp => get_local_write_time(left).cmp(&get_local_write_time(right)),
            TypeOrder::Vector => compare_vectors(l, r),
            _ => compare_maps(l, r),
        },
        _ if left_order == TypeOrder::Number => compare_numbers(left, right),
        _ => Ordering::Equal,
    }
}

/// Equality used by `==`, `in` and array membership: integers and doubles only
/// equal values of their own representation, NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
        }
        (ValueKind::Integer(_), ValueKind::Double(_)) | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l.values()
                    .iter()
                    .zip(r.values().iter())
                    .all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().all(|(key, value)| {
                    r.fields()
                        .get(key)
                        .map(|other| values_equal(value, other))
                        .unwrap_or(false)
                })
        }
        _ => type_order(left) == type_order(right) && compare_values(left, right) == Ordering::Equal,
    }
}

fn compare_numbers(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        _ => compare_doubles(
            left.as_double().unwrap_or(f64::NAN),
            right.as_double().unwrap_or(f64::NAN),
        ),
    }
}

/// NaN sorts before every other number and equals itself.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_arrays(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = compare_values(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

fn compare_vectors(left: &MapValue, right: &MapValue) -> Ordering {
    let l = left
        .fields()
        .get(VECTOR_VALUE_KEY)
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values())
        .unwrap_or(&[]);
    let r = right
        .fields()
        .get(VECTOR_VALUE_KEY)
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values())
        .unwrap_or(&[]);
    l.len().cmp(&r.len()).then_with(|| compare_arrays(l, r))
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields().iter()) {
        let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.fields().len().cmp(&right.fields().len())
}
