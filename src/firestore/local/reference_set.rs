use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Bidirectional `id <-> document key` references.
///
/// Used for the documents a local view currently shows and for limbo documents held
/// by the sync engine. Ids are target ids or batch ids depending on the owner.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = DocumentKey>,
    {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'a, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.by_key.remove(&(key.clone(), id));
        }
        self.by_id
            .retain(|(reference_id, _)| *reference_id != id);
        keys
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> Vec<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::min_key())..)
            .take_while(|(reference_id, _)| *reference_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .map(|(candidate, _)| candidate == key)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_in_both_directions() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("a/1"), 1);
        refs.add_reference(key("a/2"), 1);
        refs.add_reference(key("a/1"), 2);

        assert_eq!(refs.references_for_id(1), vec![key("a/1"), key("a/2")]);
        assert!(refs.contains_key(&key("a/1")));

        let removed = refs.remove_references_for_id(1);
        assert_eq!(removed.len(), 2);
        assert!(refs.contains_key(&key("a/1")));
        assert!(!refs.contains_key(&key("a/2")));

        refs.remove_reference(&key("a/1"), 2);
        assert!(refs.is_empty());
    }
}
