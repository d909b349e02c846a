use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::ResourcePath;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() < 2 || path.len() % 2 != 0 {
            return Err(invalid_argument(format!(
                "Document keys must point to a document (even number of segments): {path}"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    /// Smallest key that sorts at or after every document directly inside `collection`.
    ///
    /// Only used as a range bound for ordered scans, never stored.
    pub(crate) fn collection_scan_start(collection: &ResourcePath) -> Self {
        Self {
            path: collection.child([""]),
        }
    }

    /// Key that sorts before every valid document key.
    pub(crate) fn min_key() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the collection directly containing this document.
    pub fn collection_group(&self) -> &str {
        let len = self.path.len();
        if len < 2 {
            return "";
        }
        self.path.segment(len - 2).unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl From<DocumentKey> for String {
    fn from(key: DocumentKey) -> Self {
        key.path.canonical_string()
    }
}

impl TryFrom<String> for DocumentKey {
    type Error = FirestoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_string(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("cities/sf/landmarks/bridge").unwrap();
        assert_eq!(key.id(), "bridge");
        assert_eq!(key.collection_group(), "landmarks");
        assert_eq!(key.collection_path().canonical_string(), "cities/sf/landmarks");
    }

    #[test]
    fn scan_start_sorts_before_collection_members() {
        let collection = ResourcePath::from_string("cities").unwrap();
        let start = DocumentKey::collection_scan_start(&collection);
        let first = DocumentKey::from_string("cities/a").unwrap();
        assert!(start < first);
        assert!(DocumentKey::min_key() < start);
    }
}
