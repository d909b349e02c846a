use std::collections::HashMap;
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots when only per-document pending-write state changed.
    pub include_metadata_changes: bool,
    /// Hold back the first cached snapshot while the client may still reach the backend.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self, enabled: bool) -> Self {
        self.include_metadata_changes = enabled;
        self
    }

    pub fn with_wait_for_sync_when_online(mut self, enabled: bool) -> Self {
        self.wait_for_sync_when_online = enabled;
        self
    }
}

pub type ListenerId = u64;

/// Receives snapshots, or a single terminal error, for one listener.
///
/// Observers run on the client's queue and must not block on the client.
pub type SnapshotObserver = Box<dyn FnMut(FirestoreResult<ViewSnapshot>) + Send>;

/// Filters the raw view snapshots of a query down to what one listener asked for.
pub struct QueryListener {
    options: ListenOptions,
    observer: SnapshotObserver,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(options: ListenOptions, observer: SnapshotObserver) -> Self {
        Self {
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    /// Returns true when the observer was called.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            snapshot.without_metadata_changes()
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            (self.observer)(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(mut self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    pub fn apply_online_state_change(&mut self, state: OnlineState) -> bool {
        self.online_state = state;
        let ready = match &self.snapshot {
            Some(snapshot) => !self.raised_initial_event && self.should_raise_initial_event(snapshot, state),
            None => false,
        };
        if ready {
            if let Some(snapshot) = self.snapshot.clone() {
                self.raise_initial_event(&snapshot);
            }
        }
        ready
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only worth showing once we know nothing better
        // is coming soon.
        !snapshot.documents.is_empty() || snapshot.has_cached_results || state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        snapshot.sync_state_changed || pending_writes_changed
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            Arc::clone(&snapshot.query),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        (self.observer)(Ok(initial));
    }
}

struct QueryListeners {
    query: Arc<Query>,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<(ListenerId, QueryListener)>,
}

/// Fans view snapshots out to every listener of a query.
pub struct EventManager {
    queries: HashMap<String, QueryListeners>,
    query_by_listener: HashMap<ListenerId, String>,
    next_listener_id: ListenerId,
    online_state: OnlineState,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            queries: HashMap::new(),
            query_by_listener: HashMap::new(),
            next_listener_id: 1,
            online_state: OnlineState::Unknown,
        }
    }

    /// Registers a listener. The flag is true when it is the first for its query, in
    /// which case the caller has to start listening to the query.
    pub fn add_listener(
        &mut self,
        query: Arc<Query>,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> (ListenerId, bool) {
        let id = self.next_listener_id;
        self.next_listener_id += 1;

        let canonical_id = query.canonical_id();
        let first = !self.queries.contains_key(&canonical_id);
        let entry = self
            .queries
            .entry(canonical_id.clone())
            .or_insert_with(|| QueryListeners {
                query,
                view_snapshot: None,
                listeners: Vec::new(),
            });

        let mut listener = QueryListener::new(options, observer);
        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = &entry.view_snapshot {
            listener.on_view_snapshot(snapshot.clone());
        }
        entry.listeners.push((id, listener));
        self.query_by_listener.insert(id, canonical_id);
        (id, first)
    }

    /// Drops a listener. Returns its query and whether it was the last listener on it.
    pub fn remove_listener(&mut self, id: ListenerId) -> Option<(Arc<Query>, bool)> {
        let canonical_id = self.query_by_listener.remove(&id)?;
        let entry = self.queries.get_mut(&canonical_id)?;
        entry.listeners.retain(|(listener_id, _)| *listener_id != id);
        if entry.listeners.is_empty() {
            let entry = self.queries.remove(&canonical_id)?;
            Some((entry.query, true))
        } else {
            Some((Arc::clone(&entry.query), false))
        }
    }

    pub fn has_listeners(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub fn listener_count(&self) -> usize {
        self.query_by_listener.len()
    }

    pub fn on_view_snapshots(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(entry) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for (_, listener) in entry.listeners.iter_mut() {
                listener.on_view_snapshot(snapshot.clone());
            }
            entry.view_snapshot = Some(snapshot);
        }
    }

    /// Delivers `error` to every listener of `query` and forgets them.
    pub fn on_listen_error(&mut self, query: &Query, error: FirestoreError) {
        let Some(entry) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        log::debug!(
            "firestore: listen for {} failed: {error}",
            query.canonical_id()
        );
        for (id, listener) in entry.listeners {
            self.query_by_listener.remove(&id);
            listener.on_error(error.clone());
        }
    }

    pub fn on_online_state_change(&mut self, state: OnlineState) {
        self.online_state = state;
        for entry in self.queries.values_mut() {
            for (_, listener) in entry.listeners.iter_mut() {
                listener.apply_online_state_change(state);
            }
        }
    }
}
