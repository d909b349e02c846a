use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after the existence filter count disagreed with the cache.
    ExistenceFilterMismatch,
    /// Re-listen after the bloom filter proved a cached document absent.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// Cached metadata for one target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Latest version at which the target was consistent with the backend.
    pub snapshot_version: SnapshotVersion,
    /// Latest consistent version at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(with = "crate::firestore::local::local_serializer::base64_bytes")]
    pub resume_token: Bytes,
    /// Document count the backend should report, sent with resumed listens.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Bytes::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// Replaces the resume token; clears any expected count since it described the old token.
    pub fn with_resume_token(&self, resume_token: Bytes, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
