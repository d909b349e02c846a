//! Messages exchanged on the listen and write streams.
//!
//! These are the decoded forms the engine works with; how they are framed on the
//! wire is up to the [`Connection`](crate::firestore::remote::connection::Connection)
//! implementation.

use bytes::Bytes;

use crate::firestore::core::query::Target;
use crate::firestore::error::FirestoreError;
use crate::firestore::model::{Document, DocumentKey, Mutation, MutationResult, SnapshotVersion, TargetId};

/// Request sent on the listen stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenRequest {
    AddTarget(WatchTarget),
    RemoveTarget(TargetId),
}

/// A target as sent to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchTarget {
    pub target_id: TargetId,
    pub target: Target,
    /// Resume point; empty for a fresh listen.
    pub resume_token: Bytes,
    /// Document count the client expects, present only when resuming.
    pub expected_count: Option<i32>,
}

/// One message received on the listen stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means every target the stream currently watches.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Bytes,
    /// Set on global `NoChange` messages: every target is consistent at this version.
    pub read_time: SnapshotVersion,
    /// Present on `Removed` when the backend rejected the target.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Bytes::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Snapshot version implied by this message, if it is a global consistency point.
    pub fn snapshot_version(&self) -> Option<SnapshotVersion> {
        if self.state == WatchTargetChangeState::NoChange && self.target_ids.is_empty() && !self.read_time.is_min() {
            Some(self.read_time)
        } else {
            None
        }
    }
}

/// A document entered, changed, left, or was deleted from targets.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// The new state: a found document, a no-document for deletes, or `None` when the
    /// document merely stopped matching.
    pub new_document: Option<Document>,
}

/// Bloom filter payload naming the documents that still match a target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: u32,
    pub hash_count: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Request sent on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// First message on a fresh stream; answered with an empty response carrying a token.
    Handshake,
    Mutations {
        stream_token: Bytes,
        mutations: Vec<Mutation>,
    },
}

/// One message received on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Bytes,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}
