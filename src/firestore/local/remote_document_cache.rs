use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::table::{JournaledTable, Table};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath, SnapshotVersion};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RemoteDocumentEntry {
    document: Document,
    size: usize,
}

/// Last known backend state of every cached document.
pub struct RemoteDocumentCache {
    documents: Table<DocumentKey, RemoteDocumentEntry>,
    index_manager: IndexManager,
}

impl RemoteDocumentCache {
    pub(crate) fn new() -> Self {
        Self {
            documents: Table::new("remote_documents"),
            index_manager: IndexManager::new(),
        }
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    pub(crate) fn index_manager_mut(&mut self) -> &mut IndexManager {
        &mut self.index_manager
    }

    /// Stores `document`, stamping it with `read_time`.
    pub fn add_entry(&mut self, document: &Document, read_time: SnapshotVersion) {
        let mut document = document.clone();
        document.set_read_time(read_time);
        let key = document.key().clone();
        self.index_manager
            .add_to_collection_parent_index(&key.collection_path());
        let previous = self.documents.get(&key).map(|entry| entry.document.clone());
        self.index_manager
            .update_document(&key, previous.as_ref(), Some(&document));
        let size = document.estimated_byte_size();
        self.documents.insert(key, RemoteDocumentEntry { document, size });
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) -> bool {
        match self.documents.remove(key) {
            Some(entry) => {
                self.index_manager
                    .update_document(key, Some(&entry.document), None);
                true
            }
            None => false,
        }
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(&self, key: &DocumentKey) -> Document {
        self.documents
            .get(key)
            .map(|entry| entry.document.clone())
            .unwrap_or_else(|| Document::new_invalid_document(key.clone()))
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn get_entries<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, Document>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    /// Documents directly inside `collection` read after `since_read_time`.
    pub fn get_documents_in_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> (BTreeMap<DocumentKey, Document>, usize) {
        let mut read = 0;
        let mut results = BTreeMap::new();
        let start = DocumentKey::collection_scan_start(collection);
        for (key, entry) in self
            .documents
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
        {
            if !collection.is_immediate_parent_of(key.path()) {
                continue;
            }
            read += 1;
            if entry.document.read_time() > since_read_time || since_read_time.is_min() {
                results.insert(key.clone(), entry.document.clone());
            }
        }
        (results, read)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.len() == 0
    }

    /// Approximate bytes held by cached documents.
    pub fn byte_size(&self) -> u64 {
        self.documents
            .iter()
            .map(|(_, entry)| entry.size as u64)
            .sum()
    }

    /// Creates and backfills a single-field index over one collection group.
    pub(crate) fn create_field_index(&mut self, collection_group: &str, field: FieldPath) {
        if !self
            .index_manager
            .create_field_index(collection_group, field)
        {
            return;
        }
        let matching: BTreeSet<DocumentKey> = self
            .documents
            .iter()
            .filter(|(key, _)| key.has_collection_id(collection_group))
            .map(|(key, _)| key.clone())
            .collect();
        for key in matching {
            if let Some(entry) = self.documents.get(&key) {
                self.index_manager
                    .update_document(&key, None, Some(&entry.document));
            }
        }
    }

    pub(crate) fn tables_mut(&mut self) -> [&mut dyn JournaledTable; 2] {
        let [parents] = self.index_manager.tables_mut();
        [&mut self.documents, parents]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str) -> Document {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), FirestoreValue::from_string(path));
        Document::new_found_document(DocumentKey::from_string(path).unwrap(), version(1), MapValue::new(map))
    }

    #[test]
    fn missing_entries_are_invalid_documents() {
        let cache = RemoteDocumentCache::new();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        assert!(!cache.get_entry(&key).is_valid_document());
    }

    #[test]
    fn collection_scan_skips_subcollections_and_old_reads() {
        let mut cache = RemoteDocumentCache::new();
        cache.add_entry(&doc("rooms/a"), version(1));
        cache.add_entry(&doc("rooms/b"), version(5));
        cache.add_entry(&doc("rooms/a/messages/m1"), version(5));
        cache.add_entry(&doc("roomsx/c"), version(5));

        let rooms = ResourcePath::from_string("rooms").unwrap();
        let (all, read) = cache.get_documents_in_collection(&rooms, SnapshotVersion::min());
        assert_eq!(all.len(), 2);
        assert_eq!(read, 2);

        let (recent, _) = cache.get_documents_in_collection(&rooms, version(2));
        assert_eq!(recent.keys().map(|k| k.id()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(cache.index_manager().collection_parents("messages").len(), 1);
    }

    #[test]
    fn tracks_byte_size() {
        let mut cache = RemoteDocumentCache::new();
        cache.add_entry(&doc("rooms/a"), version(1));
        let size = cache.byte_size();
        assert!(size > 0);
        cache.remove_entry(&DocumentKey::from_string("rooms/a").unwrap());
        assert_eq!(cache.byte_size(), 0);
    }
}
