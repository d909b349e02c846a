use std::collections::BTreeSet;

use bytes::Bytes;

use crate::firestore::credentials::User;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

/// What the remote store calls back into.
///
/// Every call happens on the client's queue, so implementations take `&mut self`
/// and never block on the network.
pub trait RemoteSyncer {
    /// Applies a consistent snapshot assembled from the watch stream.
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to listen to `target_id`.
    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend permanently rejected the batch at the head of the queue.
    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the client currently believes match `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// First pending batch after `after_batch_id`.
    fn next_mutation_batch(&mut self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>>;

    fn set_last_stream_token(&mut self, stream_token: Bytes) -> FirestoreResult<()>;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn handle_online_state_change(&mut self, state: OnlineState);

    /// Switches the mutation queue and overlays to `user`.
    fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()>;
}
