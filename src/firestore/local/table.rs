use std::collections::BTreeMap;
use std::ops::RangeBounds;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::storage::StorageWrite;

/// An ordered in-memory table whose changes are journaled while a transaction is open.
///
/// The first write to a row inside a transaction records the row's prior value so the
/// transaction can be rolled back, and the set of touched rows becomes the storage batch
/// on commit.
#[derive(Debug)]
pub(crate) struct Table<K, V> {
    name: &'static str,
    rows: BTreeMap<K, V>,
    journal: Option<BTreeMap<K, Option<V>>>,
}

impl<K, V> Table<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: BTreeMap::new(),
            journal: None,
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.rows.get(key)
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.rows.iter()
    }

    pub(crate) fn range<R>(&self, range: R) -> impl Iterator<Item = (&K, &V)>
    where
        R: RangeBounds<K>,
    {
        self.rows.range(range)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        self.record(&key);
        self.rows.insert(key, value);
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        if !self.rows.contains_key(key) {
            return None;
        }
        self.record(key);
        self.rows.remove(key)
    }

    fn record(&mut self, key: &K) {
        if let Some(journal) = self.journal.as_mut() {
            if !journal.contains_key(key) {
                journal.insert(key.clone(), self.rows.get(key).cloned());
            }
        }
    }
}

/// Type-erased view of a table used by the persistence transaction runner.
pub(crate) trait JournaledTable {
    fn name(&self) -> &'static str;

    fn begin(&mut self);

    fn rollback(&mut self);

    /// One write per row touched since `begin`.
    fn pending_writes(&self) -> FirestoreResult<Vec<StorageWrite>>;

    /// Discards the journal once its writes are durable.
    fn end(&mut self);

    fn load(&mut self, rows: &BTreeMap<String, JsonValue>) -> FirestoreResult<()>;
}

impl<K, V> JournaledTable for Table<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn begin(&mut self) {
        self.journal = Some(BTreeMap::new());
    }

    fn rollback(&mut self) {
        if let Some(journal) = self.journal.take() {
            for (key, previous) in journal {
                match previous {
                    Some(value) => {
                        self.rows.insert(key, value);
                    }
                    None => {
                        self.rows.remove(&key);
                    }
                }
            }
        }
    }

    fn pending_writes(&self) -> FirestoreResult<Vec<StorageWrite>> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(Vec::new());
        };
        let mut writes = Vec::with_capacity(journal.len());
        for key in journal.keys() {
            let encoded_key = serde_json::to_string(key)
                .map_err(|err| internal_error(format!("failed to encode {} key: {err}", self.name)))?;
            let value = match self.rows.get(key) {
                Some(value) => Some(serde_json::to_value(value).map_err(|err| {
                    internal_error(format!("failed to encode {} row: {err}", self.name))
                })?),
                None => None,
            };
            writes.push(StorageWrite {
                table: self.name,
                key: encoded_key,
                value,
            });
        }
        Ok(writes)
    }

    fn end(&mut self) {
        self.journal = None;
    }

    fn load(&mut self, rows: &BTreeMap<String, JsonValue>) -> FirestoreResult<()> {
        self.rows.clear();
        self.journal = None;
        for (encoded_key, value) in rows {
            let key: K = serde_json::from_str(encoded_key)
                .map_err(|err| internal_error(format!("corrupt {} key: {err}", self.name)))?;
            let value: V = serde_json::from_value(value.clone())
                .map_err(|err| internal_error(format!("corrupt {} row: {err}", self.name)))?;
            self.rows.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_previous_rows() {
        let mut table: Table<i32, String> = Table::new("numbers");
        table.insert(1, "one".into());
        table.begin();
        table.insert(1, "uno".into());
        table.insert(2, "dos".into());
        table.remove(&1);
        table.rollback();
        assert_eq!(table.get(&1).map(String::as_str), Some("one"));
        assert!(!table.contains_key(&2));
    }

    #[test]
    fn pending_writes_has_one_entry_per_touched_row() {
        let mut table: Table<(i32, String), i64> = Table::new("pairs");
        table.begin();
        table.insert((1, "a".into()), 10);
        table.insert((1, "a".into()), 11);
        table.insert((2, "b".into()), 20);
        table.remove(&(2, "b".into()));
        let writes = table.pending_writes().unwrap();
        table.end();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].key, "[1,\"a\"]");
        assert_eq!(writes[0].value, Some(JsonValue::from(11)));
        assert_eq!(writes[1].value, None);
    }

    #[test]
    fn load_round_trips_finished_rows() {
        let mut table: Table<(i32, String), i64> = Table::new("pairs");
        table.begin();
        table.insert((3, "c".into()), 30);
        let writes = table.pending_writes().unwrap();
        table.end();
        let rows: BTreeMap<String, JsonValue> = writes
            .into_iter()
            .filter_map(|write| write.value.map(|value| (write.key, value)))
            .collect();

        let mut restored: Table<(i32, String), i64> = Table::new("pairs");
        restored.load(&rows).unwrap();
        assert_eq!(restored.get(&(3, "c".into())), Some(&30));
    }
}
