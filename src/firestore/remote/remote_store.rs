use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use crate::firestore::credentials::{TokenProviderArc, User};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::connection::{Connection, ListenResponse};
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::stream::{
    ListenStream, StreamEvent, StreamEventSink, StreamNotification, WriteStream,
};
use crate::firestore::remote::watch_change::{ListenRequest, WatchChange, WatchTarget, WriteRequest, WriteResponse};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::settings::RemoteSettings;

/// Batches sent on the write stream before waiting for an acknowledgement.
///
/// One in flight keeps acknowledgements trivially ordered with the queue.
pub const MAX_PENDING_WRITES: usize = 1;

/// Events from the streams and timers, delivered back onto the client's queue.
#[derive(Debug)]
pub enum RemoteMessage {
    Listen {
        generation: u64,
        event: StreamEvent<ListenResponse>,
    },
    Write {
        generation: u64,
        event: StreamEvent<WriteResponse>,
    },
    OnlineStateTimeout(u64),
}

pub type RemoteMessageSink = Arc<dyn Fn(RemoteMessage) + Send + Sync>;

/// Reasons the remote store keeps the network off. Any entry disables it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

/// Owns the listen and write streams and keeps them in line with what the client
/// wants: which targets are watched and which batches still await the backend.
///
/// All methods run on the client's queue and take the [`RemoteSyncer`] they report to.
pub struct RemoteStore {
    database_id: DatabaseId,
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    /// Present only while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    write_stream_token: Bytes,
    handshake_complete: bool,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
}

/// Targets as the remote store knows them, with keys from the syncer.
struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

impl RemoteStore {
    pub fn new(
        database_id: DatabaseId,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        settings: &RemoteSettings,
        sink: RemoteMessageSink,
    ) -> Self {
        let listen_sink: StreamEventSink<ListenResponse> = {
            let sink = Arc::clone(&sink);
            Arc::new(move |generation, event| sink(RemoteMessage::Listen { generation, event }))
        };
        let write_sink: StreamEventSink<WriteResponse> = {
            let sink = Arc::clone(&sink);
            Arc::new(move |generation, event| sink(RemoteMessage::Write { generation, event }))
        };
        let timeout_sink = Arc::new(move |timer_id| sink(RemoteMessage::OnlineStateTimeout(timer_id)));

        Self {
            watch_stream: ListenStream::new(
                Arc::clone(&connection),
                Arc::clone(&token_provider),
                database_id.clone(),
                settings,
                listen_sink,
            ),
            write_stream: WriteStream::new(connection, token_provider, database_id.clone(), settings, write_sink),
            database_id,
            listen_targets: BTreeMap::new(),
            watch_change_aggregator: None,
            write_pipeline: VecDeque::new(),
            write_stream_token: Bytes::new(),
            handshake_complete: false,
            offline_causes: BTreeSet::new(),
            online_state_tracker: OnlineStateTracker::new(settings.online_state_timeout, timeout_sink),
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer);
    }

    /// Stops both streams; cached reads keep working and writes stay queued.
    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        let change = self.online_state_tracker.set(OnlineState::Offline);
        self.apply_online_state_change(syncer, change);
    }

    pub fn shutdown(&mut self, syncer: &mut dyn RemoteSyncer) {
        log::debug!("firestore: remote store shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        self.write_stream.terminate();
        self.watch_stream.terminate();
        let change = self.online_state_tracker.set(OnlineState::Unknown);
        self.apply_online_state_change(syncer, change);
    }

    /// Restarts the streams under `user`'s credentials.
    pub fn handle_credential_change(&mut self, syncer: &mut dyn RemoteSyncer, user: User) -> FirestoreResult<()> {
        log::debug!("firestore: restarting streams for {user}");
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        let change = self.online_state_tracker.set(OnlineState::Unknown);
        self.apply_online_state_change(syncer, change);

        let result = syncer.handle_credential_change(user);
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal(syncer);
        result
    }

    /// Starts watching `target_data` unless it is already watched.
    pub fn listen(&mut self, syncer: &mut dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&*syncer, target_data);
        }
    }

    pub fn unlisten(&mut self, syncer: &mut dyn RemoteSyncer, target_id: TargetId) {
        self.listen_targets.remove(&target_id);
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }

        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // Without targets the stream cannot prove the client is online.
                let change = self.online_state_tracker.set(OnlineState::Unknown);
                self.apply_online_state_change(syncer, change);
            }
        }
    }

    /// Pulls pending batches from the syncer onto the write stream.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id);

        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    /// Routes a stream or timer event; failures of the syncer are logged.
    pub fn handle_message(&mut self, syncer: &mut dyn RemoteSyncer, message: RemoteMessage) {
        let result = match message {
            RemoteMessage::Listen { generation, event } => match self.watch_stream.handle_event(generation, event) {
                Some(StreamNotification::Opened) => {
                    self.on_watch_stream_open(&*syncer);
                    Ok(())
                }
                Some(StreamNotification::Message(change)) => self.on_watch_stream_change(syncer, change),
                Some(StreamNotification::Closed(error)) => {
                    self.on_watch_stream_close(syncer, error);
                    Ok(())
                }
                None => Ok(()),
            },
            RemoteMessage::Write { generation, event } => match self.write_stream.handle_event(generation, event) {
                Some(StreamNotification::Opened) => {
                    self.write_stream.send(WriteRequest::Handshake);
                    Ok(())
                }
                Some(StreamNotification::Message(response)) => self.on_write_stream_response(syncer, response),
                Some(StreamNotification::Closed(error)) => self.on_write_stream_close(syncer, error),
                None => Ok(()),
            },
            RemoteMessage::OnlineStateTimeout(timer_id) => {
                let change = self.online_state_tracker.handle_timeout(timer_id);
                self.apply_online_state_change(syncer, change);
                Ok(())
            }
        };
        if let Err(err) = result {
            log::error!("firestore: failed to apply remote change: {err}");
        }
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) {
        if !self.can_use_network() {
            return;
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else {
            let change = self.online_state_tracker.set(OnlineState::Unknown);
            self.apply_online_state_change(syncer, change);
        }
        if let Err(err) = self.fill_write_pipeline(syncer) {
            log::warn!("firestore: could not read pending writes: {err}");
        }
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop();
        self.watch_stream.stop();
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "firestore: stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.watch_change_aggregator = None;
    }

    fn apply_online_state_change(&mut self, syncer: &mut dyn RemoteSyncer, change: Option<OnlineState>) {
        if let Some(state) = change {
            let offline = state == OnlineState::Offline;
            self.watch_stream.set_offline(offline);
            self.write_stream.set_offline(offline);
            syncer.handle_online_state_change(state);
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.watch_change_aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
        self.watch_stream.start();
        let change = self.online_state_tracker.handle_watch_stream_start();
        self.apply_online_state_change(syncer, change);
    }

    fn send_watch_request(&mut self, syncer: &dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let resuming = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min();
        let expected_count = resuming.then(|| syncer.get_remote_keys_for_target(target_id).len() as i32);
        self.watch_stream.send(ListenRequest::AddTarget(WatchTarget {
            target_id,
            target: target_data.target,
            resume_token: target_data.resume_token,
            expected_count,
        }));
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.send(ListenRequest::RemoveTarget(target_id));
    }

    fn on_watch_stream_open(&mut self, syncer: &dyn RemoteSyncer) {
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(syncer, target_data);
        }
    }

    fn on_watch_stream_close(&mut self, syncer: &mut dyn RemoteSyncer, error: Option<FirestoreError>) {
        self.watch_change_aggregator = None;
        if self.should_start_watch_stream() {
            if let Some(error) = &error {
                let change = self.online_state_tracker.handle_watch_stream_failure(error);
                self.apply_online_state_change(syncer, change);
            }
            self.start_watch_stream(syncer);
        } else {
            let change = self.online_state_tracker.set(OnlineState::Unknown);
            self.apply_online_state_change(syncer, change);
        }
    }

    fn on_watch_stream_change(&mut self, syncer: &mut dyn RemoteSyncer, change: ListenResponse) -> FirestoreResult<()> {
        // Any traffic on the watch stream means the backend is reachable.
        let online = self.online_state_tracker.set(OnlineState::Online);
        self.apply_online_state_change(syncer, online);

        let mut snapshot_version = None;
        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(cause) = &target_change.cause {
                return self.handle_target_error(syncer, &target_change.target_ids, cause);
            }
            snapshot_version = target_change.snapshot_version();
        }

        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return Ok(());
        };
        {
            let metadata = ListenTargetMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            match change {
                WatchChange::Document(change) => aggregator.handle_document_change(change, &metadata),
                WatchChange::ExistenceFilter(change) => aggregator.handle_existence_filter(&change, &metadata),
                WatchChange::TargetChange(change) => aggregator.handle_target_change(&change, &metadata),
            }
        }

        match snapshot_version {
            Some(version) if version >= syncer.last_remote_snapshot_version() => {
                self.raise_watch_snapshot(syncer, version)
            }
            _ => Ok(()),
        }
    }

    fn raise_watch_snapshot(&mut self, syncer: &mut dyn RemoteSyncer, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return Ok(());
        };
        let event = {
            let metadata = ListenTargetMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            aggregator.create_remote_event(snapshot_version, &metadata)
        };

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get_mut(target_id) else {
                continue;
            };
            // Forget the resume token so the backend sends the full result set again.
            *target_data = target_data.with_resume_token(Bytes::new(), target_data.snapshot_version);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_unwatch_request(*target_id);
            self.send_watch_request(&*syncer, request);
        }

        syncer.apply_remote_event(event)
    }

    fn handle_target_error(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        target_ids: &[TargetId],
        cause: &FirestoreError,
    ) -> FirestoreResult<()> {
        for target_id in target_ids {
            if self.listen_targets.remove(target_id).is_none() {
                continue;
            }
            if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            syncer.reject_listen(*target_id, cause.clone())?;
        }
        Ok(())
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn start_write_stream(&mut self) {
        self.handshake_complete = false;
        self.write_stream.start();
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.handshake_complete {
            self.write_stream.send(WriteRequest::Mutations {
                stream_token: self.write_stream_token.clone(),
                mutations: batch.mutations.clone(),
            });
        }
        self.write_pipeline.push_back(batch);
    }

    fn on_write_stream_response(&mut self, syncer: &mut dyn RemoteSyncer, response: WriteResponse) -> FirestoreResult<()> {
        self.write_stream_token = response.stream_token.clone();

        if !self.handshake_complete {
            self.handshake_complete = true;
            syncer.set_last_stream_token(response.stream_token)?;
            let requests: Vec<WriteRequest> = self
                .write_pipeline
                .iter()
                .map(|batch| WriteRequest::Mutations {
                    stream_token: self.write_stream_token.clone(),
                    mutations: batch.mutations.clone(),
                })
                .collect();
            for request in requests {
                self.write_stream.send(request);
            }
            return Ok(());
        }

        let batch = self
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("write response received with no pending batch"))?;
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.write_results,
            response.stream_token,
        )?;
        syncer.apply_successful_write(result)?;
        self.fill_write_pipeline(syncer)
    }

    fn on_write_stream_close(&mut self, syncer: &mut dyn RemoteSyncer, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = &error {
            if !self.write_pipeline.is_empty() {
                if self.handshake_complete {
                    self.handle_write_error(syncer, error)?;
                } else {
                    self.handle_handshake_error(syncer, error)?;
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    fn handle_handshake_error(&mut self, syncer: &mut dyn RemoteSyncer, error: &FirestoreError) -> FirestoreResult<()> {
        if error.code.is_permanent_error() {
            log::debug!("firestore: write stream handshake failed permanently ({error}), resetting stream token");
            self.write_stream_token = Bytes::new();
            syncer.set_last_stream_token(Bytes::new())?;
        }
        Ok(())
    }

    fn handle_write_error(&mut self, syncer: &mut dyn RemoteSyncer, error: &FirestoreError) -> FirestoreResult<()> {
        if !error.code.is_permanent_write_error() {
            return Ok(());
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Ok(());
        };
        // The batch is gone for good, so the next batch can go out right away.
        self.write_stream.inhibit_backoff();
        syncer.reject_failed_write(batch.batch_id, error.clone())?;
        self.fill_write_pipeline(syncer)
    }
}
