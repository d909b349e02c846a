use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;

use crate::firestore::api::snapshot::{DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
use crate::firestore::core::{
    AsyncQueue, DelayedOperation, ListenOptions, ListenerId, Query, RemoteCommand, SnapshotObserver, SyncEngine,
};
use crate::firestore::credentials::{TokenProviderArc, User};
use crate::firestore::error::{cancelled, FirestoreResult};
use crate::firestore::local::{LocalStore, LruParams, LruResults, Persistence, QueryEngine};
use crate::firestore::model::user_data::{parse_set_data, parse_update_data};
use crate::firestore::model::{DocumentKey, Mutation, SetOptions};
use crate::firestore::remote::{Connection, OnlineState, RemoteMessage, RemoteMessageSink, RemoteStore};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::value::FirestoreValue;

/// Everything the client mutates, owned by its queue.
struct ClientState {
    queue: AsyncQueue<ClientState>,
    sync_engine: SyncEngine,
    remote_store: RemoteStore,
    gc_interval: Duration,
    gc_task: Option<DelayedOperation>,
}

impl ClientState {
    /// Runs `operation`, then forwards whatever it asked of the network.
    fn run<R>(&mut self, operation: impl FnOnce(&mut Self) -> R) -> R {
        let result = operation(self);
        self.drain_remote_commands();
        result
    }

    fn drain_remote_commands(&mut self) {
        loop {
            let commands = self.sync_engine.take_remote_commands();
            if commands.is_empty() {
                return;
            }
            for command in commands {
                match command {
                    RemoteCommand::Listen(target_data) => {
                        self.remote_store.listen(&mut self.sync_engine, target_data)
                    }
                    RemoteCommand::Unlisten(target_id) => {
                        self.remote_store.unlisten(&mut self.sync_engine, target_id)
                    }
                    RemoteCommand::FillWritePipeline => {
                        if let Err(err) = self.remote_store.fill_write_pipeline(&mut self.sync_engine) {
                            log::warn!("firestore: failed to fill the write pipeline: {err}");
                        }
                    }
                }
            }
        }
    }

    fn handle_remote_message(&mut self, message: RemoteMessage) {
        self.run(|state| state.remote_store.handle_message(&mut state.sync_engine, message));
    }

    fn schedule_gc(&mut self, delay: Duration) {
        self.gc_task = Some(self.queue.enqueue_after_delay(delay, |state: &mut ClientState| {
            state.run_gc();
            let interval = state.gc_interval;
            state.schedule_gc(interval);
        }));
    }

    fn run_gc(&mut self) {
        match self.sync_engine.local_store_mut().collect_garbage() {
            Ok(results) if results.did_run => log::debug!(
                "firestore: LRU collection removed {} targets and {} documents",
                results.targets_removed,
                results.documents_removed
            ),
            Ok(_) => {}
            Err(err) => log::warn!("firestore: LRU collection failed: {err}"),
        }
    }

    fn terminate(&mut self) {
        if let Some(task) = self.gc_task.take() {
            task.cancel();
        }
        self.remote_store.shutdown(&mut self.sync_engine);
        self.sync_engine.local_store_mut().shutdown();
        self.queue.shutdown();
    }
}

/// Offline-first client: a local cache kept in sync with a backend through the
/// given [`Connection`].
///
/// Every operation is serialized on one queue, so reads observe all writes
/// issued before them. Clones share the same underlying client.
#[derive(Clone)]
pub struct FirestoreClient {
    queue: AsyncQueue<ClientState>,
}

impl FirestoreClient {
    /// Creates a client for `user`, opening the cache described by `settings` and
    /// bringing the network up.
    ///
    /// A cache that cannot be opened falls back to memory; the failure is logged.
    pub fn new(
        settings: FirestoreSettings,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        user: User,
    ) -> Self {
        let gc_enabled = settings.cache_size_bytes.is_some();
        let gc_initial_delay = settings.gc_initial_delay;
        let queue = AsyncQueue::spawn_with(|queue| {
            let persistence = Persistence::open(&settings.persistence, &user);
            let local_store = LocalStore::new(
                persistence,
                QueryEngine::new(&settings),
                LruParams::from_settings(&settings),
                user,
            );
            let sink: RemoteMessageSink = {
                let queue = queue.clone();
                Arc::new(move |message| {
                    queue.enqueue_and_forget(move |state: &mut ClientState| state.handle_remote_message(message))
                })
            };
            ClientState {
                queue: queue.clone(),
                sync_engine: SyncEngine::new(local_store, settings.max_concurrent_limbo_resolutions),
                remote_store: RemoteStore::new(
                    settings.database_id.clone(),
                    connection,
                    token_provider,
                    &settings.remote,
                    sink,
                ),
                gc_interval: settings.gc_interval,
                gc_task: None,
            }
        });

        queue.enqueue_and_forget(move |state| {
            state.run(|state| state.remote_store.enable_network(&mut state.sync_engine));
            if gc_enabled {
                state.schedule_gc(gc_initial_delay);
            }
        });
        Self { queue }
    }

    /// Listens to `query`. `observer` receives a snapshot whenever the results or
    /// their metadata change, or a single error after which the listener is gone.
    ///
    /// The listener stays registered until the returned handle is removed or dropped.
    pub async fn listen<F>(&self, query: Query, options: ListenOptions, mut observer: F) -> FirestoreResult<ListenerRegistration>
    where
        F: FnMut(FirestoreResult<QuerySnapshot>) + Send + 'static,
    {
        let observer: SnapshotObserver =
            Box::new(move |result| observer(result.map(QuerySnapshot::from_view_snapshot)));
        let listener_id = self
            .queue
            .enqueue(move |state| state.run(|state| state.sync_engine.add_listener(query, options, observer)))
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            listener_id: Some(listener_id),
        })
    }

    /// Applies `mutations` locally right away and resolves once the backend has
    /// acknowledged them.
    ///
    /// Listeners see the change immediately with pending writes. While offline the
    /// returned future stays pending until the batch reaches the backend.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .enqueue(move |state| state.run(|state| state.sync_engine.write(mutations, tx)))
            .await?;
        rx.await
            .map_err(|_| cancelled("the write was abandoned because the client was terminated"))?
    }

    /// Writes `data` to the document at `path`, replacing it unless `options` merges.
    pub async fn set_doc(
        &self,
        path: &str,
        data: BTreeMap<String, FirestoreValue>,
        options: SetOptions,
    ) -> FirestoreResult<()> {
        let key = DocumentKey::from_string(path)?;
        let mutation = parse_set_data(key, data, &options)?;
        self.write(vec![mutation]).await
    }

    /// Updates fields of an existing document; fails on the backend if it is missing.
    pub async fn update_doc(&self, path: &str, data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<()> {
        let key = DocumentKey::from_string(path)?;
        let mutation = parse_update_data(key, data)?;
        self.write(vec![mutation]).await
    }

    pub async fn delete_doc(&self, path: &str) -> FirestoreResult<()> {
        let key = DocumentKey::from_string(path)?;
        self.write(vec![Mutation::delete(key)]).await
    }

    /// Runs `query` against the local cache only.
    pub async fn get_from_cache(&self, query: Query) -> FirestoreResult<QuerySnapshot> {
        let snapshot = self
            .queue
            .enqueue(move |state| state.sync_engine.get_from_cache(query))
            .await??;
        Ok(QuerySnapshot::from_view_snapshot(snapshot))
    }

    /// Reads one document from the local cache.
    ///
    /// Fails with `unavailable` when the cache knows nothing about `path`.
    pub async fn get_document_from_cache(&self, path: &str) -> FirestoreResult<DocumentSnapshot> {
        let key = DocumentKey::from_string(path)?;
        let lookup_key = key.clone();
        let document = self
            .queue
            .enqueue(move |state| state.sync_engine.get_document_from_cache(&lookup_key))
            .await??;
        Ok(match document {
            Some(document) => {
                DocumentSnapshot::from_document(&document, SnapshotMetadata::new(true, document.has_local_mutations()))
            }
            None => DocumentSnapshot::new(key, None, SnapshotMetadata::new(true, false)),
        })
    }

    /// Resolves once every write issued so far has been acknowledged or rejected.
    ///
    /// Fails with `cancelled` if the user changes first.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .enqueue(move |state| state.sync_engine.register_pending_writes_callback(tx))
            .await?;
        rx.await
            .map_err(|_| cancelled("the client was terminated before pending writes completed"))?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|state| state.run(|state| state.remote_store.enable_network(&mut state.sync_engine)))
            .await
    }

    /// Takes the client offline. Listeners switch to cached results; writes queue up.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|state| state.run(|state| state.remote_store.disable_network(&mut state.sync_engine)))
            .await
    }

    /// Switches the client to `user`.
    ///
    /// Acknowledgement futures of the previous user's writes fail with `cancelled`,
    /// and listeners are re-raised against the new user's pending writes.
    pub async fn switch_user(&self, user: User) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state| {
                state.run(|state| state.remote_store.handle_credential_change(&mut state.sync_engine, user))
            })
            .await?
    }

    pub async fn online_state(&self) -> FirestoreResult<OnlineState> {
        self.queue.enqueue(|state| state.remote_store.online_state()).await
    }

    /// Runs a garbage collection pass now instead of waiting for the schedule.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        self.queue
            .enqueue(|state| state.sync_engine.local_store_mut().collect_garbage())
            .await?
    }

    /// Shuts the client down. Outstanding write futures fail with `cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.queue.is_shut_down() {
            return Ok(());
        }
        self.queue.enqueue(ClientState::terminate).await
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_shut_down()
    }
}

/// Keeps a query listener registered; removing or dropping it unsubscribes.
#[must_use = "dropping the registration removes the listener"]
pub struct ListenerRegistration {
    queue: AsyncQueue<ClientState>,
    listener_id: Option<ListenerId>,
}

impl ListenerRegistration {
    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(listener_id) = self.listener_id.take() {
            self.queue
                .enqueue_and_forget(move |state| state.run(|state| state.sync_engine.remove_listener(listener_id)));
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::credentials::NoopTokenProvider;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::remote::InMemoryConnection;

    fn client() -> FirestoreClient {
        let (connection, _backend) = InMemoryConnection::new();
        FirestoreClient::new(
            FirestoreSettings::default(),
            connection,
            Arc::new(NoopTokenProvider),
            User::unauthenticated(),
        )
    }

    fn fields(pairs: &[(&str, i64)]) -> BTreeMap<String, FirestoreValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), FirestoreValue::from_integer(*value)))
            .collect()
    }

    #[tokio::test]
    async fn local_write_is_visible_in_cache_before_ack() {
        let client = client();
        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .set_doc("rooms/lobby", fields(&[("seats", 4)]), SetOptions::default())
                    .await
            })
        };

        let snapshot = loop {
            let snapshot = client.get_document_from_cache("rooms/lobby").await;
            if let Ok(snapshot) = snapshot {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(snapshot.exists());
        assert!(snapshot.has_pending_writes());
        assert!(snapshot.from_cache());

        client.terminate().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn unknown_document_is_unavailable_from_cache() {
        let client = client();
        let err = client.get_document_from_cache("rooms/nowhere").await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn terminated_client_rejects_operations() {
        let client = client();
        client.terminate().await.unwrap();
        assert!(client.is_terminated());
        client.terminate().await.unwrap();

        let err = client
            .get_from_cache(Query::collection("rooms").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }
}
