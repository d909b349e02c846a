use std::collections::BTreeMap;

use crate::firestore::credentials::User;
use crate::firestore::local::table::{JournaledTable, Table};
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Folded pending mutations per document, for the current user.
pub struct DocumentOverlayCache {
    user: String,
    overlays: Table<(String, DocumentKey), Overlay>,
}

impl DocumentOverlayCache {
    pub(crate) fn new() -> Self {
        Self {
            user: String::new(),
            overlays: Table::new("document_overlays"),
        }
    }

    pub(crate) fn set_user(&mut self, user: &User) {
        self.user = user.storage_key();
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(&(self.user.clone(), key.clone())).cloned()
    }

    pub fn get_overlays<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, Overlay>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .filter_map(|key| self.get_overlay(key).map(|overlay| (key.clone(), overlay)))
            .collect()
    }

    /// Saves one overlay per entry; `None` clears the key's overlay.
    pub fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Option<Mutation>>) {
        for (key, mutation) in overlays {
            let row = (self.user.clone(), key);
            match mutation {
                Some(mutation) => self.overlays.insert(row, Overlay::new(largest_batch_id, mutation)),
                None => {
                    self.overlays.remove(&row);
                }
            }
        }
    }

    /// Removes the overlays of `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id<'a, I>(&mut self, keys: I, batch_id: BatchId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            let row = (self.user.clone(), key.clone());
            if self
                .overlays
                .get(&row)
                .map(|overlay| overlay.largest_batch_id == batch_id)
                .unwrap_or(false)
            {
                self.overlays.remove(&row);
            }
        }
    }

    /// Overlays of documents directly inside `collection` newer than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = (self.user.clone(), DocumentKey::collection_scan_start(collection));
        self.overlays
            .range(start..)
            .take_while(|((owner, key), _)| *owner == self.user && collection.is_prefix_of(key.path()))
            .filter(|((_, key), overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id
            })
            .map(|((_, key), overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub(crate) fn tables_mut(&mut self) -> [&mut dyn JournaledTable; 1] {
        [&mut self.overlays]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlay_map(paths: &[&str]) -> BTreeMap<DocumentKey, Option<Mutation>> {
        paths
            .iter()
            .map(|path| (key(path), Some(Mutation::set(key(path), MapValue::empty()))))
            .collect()
    }

    #[test]
    fn removes_only_overlays_from_the_given_batch() {
        let mut cache = DocumentOverlayCache::new();
        cache.save_overlays(1, overlay_map(&["rooms/a"]));
        cache.save_overlays(2, overlay_map(&["rooms/b"]));
        cache.remove_overlays_for_batch_id([key("rooms/a"), key("rooms/b")].iter(), 1);
        assert!(cache.get_overlay(&key("rooms/a")).is_none());
        assert_eq!(cache.get_overlay(&key("rooms/b")).unwrap().largest_batch_id, 2);
    }

    #[test]
    fn overlays_are_scoped_to_user_and_collection() {
        let mut cache = DocumentOverlayCache::new();
        cache.set_user(&User::new("alice"));
        cache.save_overlays(3, overlay_map(&["rooms/a", "rooms/a/messages/m", "halls/h"]));
        let rooms = ResourcePath::from_string("rooms").unwrap();
        assert_eq!(cache.get_overlays_for_collection(&rooms, -1).len(), 1);
        assert!(cache.get_overlays_for_collection(&rooms, 3).is_empty());
        cache.set_user(&User::new("bob"));
        assert!(cache.get_overlay(&key("rooms/a")).is_none());
    }
}
