//! Local encoding of pending server timestamps.
//!
//! Until the backend assigns a commit time, a server timestamp field holds a tagged map
//! carrying the local write time and the value the field had before the write.

use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::value::TYPE_KEY;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

const SERVER_TIMESTAMP_TYPE: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

pub fn server_timestamp_value(
    local_write_time: Timestamp,
    previous_value: Option<&FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        FirestoreValue::from_string(SERVER_TIMESTAMP_TYPE),
    );
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );
    // Chained server timestamps keep the oldest real value.
    let previous = previous_value.map(|value| match get_previous_value(value) {
        Some(inner) => inner.clone(),
        None if is_server_timestamp(value) => FirestoreValue::null(),
        None => value.clone(),
    });
    if let Some(previous) = previous {
        if !previous.is_null() {
            fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
        }
    }
    FirestoreValue::from_map_value(MapValue::new(fields))
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    value
        .as_map()
        .and_then(|map| map.fields().get(TYPE_KEY))
        .and_then(FirestoreValue::as_str)
        == Some(SERVER_TIMESTAMP_TYPE)
}

pub fn get_local_write_time(value: &FirestoreValue) -> Option<Timestamp> {
    if !is_server_timestamp(value) {
        return None;
    }
    match value.as_map()?.fields().get(LOCAL_WRITE_TIME_KEY)?.kind() {
        ValueKind::Timestamp(timestamp) => Some(*timestamp),
        _ => None,
    }
}

pub fn get_previous_value(value: &FirestoreValue) -> Option<&FirestoreValue> {
    if !is_server_timestamp(value) {
        return None;
    }
    value.as_map()?.fields().get(PREVIOUS_VALUE_KEY)
}
