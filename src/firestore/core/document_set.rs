use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey};

/// Documents kept in a query's sort order, addressable by key.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    query: Arc<Query>,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(query: Arc<Query>) -> Self {
        Self {
            query,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    /// Orders two documents the way this set does.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        self.query.compare(left, right)
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let query = &self.query;
        let index = self
            .sorted
            .partition_point(|existing| query.compare(existing, &document) == Ordering::Less);
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let document = self.by_key.remove(key)?;
        if let Some(index) = self.position(&document) {
            self.sorted.remove(index);
        }
        Some(document)
    }

    fn position(&self, document: &Document) -> Option<usize> {
        let start = self
            .sorted
            .partition_point(|existing| self.query.compare(existing, document) == Ordering::Less);
        self.sorted[start..]
            .iter()
            .position(|existing| existing.key() == document.key())
            .map(|offset| start + offset)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}
