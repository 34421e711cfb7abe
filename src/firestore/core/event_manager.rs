use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::{ChangeType, OnlineState, Query, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

pub type SnapshotCallback = Arc<dyn Fn(ViewSnapshot) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(FirestoreError) + Send + Sync>;

/// Where a listener reads from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// The cache, kept in sync with the backend.
    #[default]
    Default,
    /// The cache only. No remote listen is started for the query.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots when only the metadata of the result changed.
    pub include_metadata_changes: bool,
    pub source: ListenSource,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn from_cache(mut self) -> Self {
        self.source = ListenSource::Cache;
        self
    }
}

/// Callbacks of one listener.
#[derive(Clone)]
pub struct QueryObserver {
    on_next: SnapshotCallback,
    on_error: Option<ErrorCallback>,
}

impl QueryObserver {
    pub fn new(on_next: impl Fn(ViewSnapshot) + Send + Sync + 'static) -> Self {
        Self {
            on_next: Arc::new(on_next),
            on_error: None,
        }
    }

    pub fn with_error(mut self, on_error: impl Fn(FirestoreError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Stops delivering anything once `muted` is set.
    pub(crate) fn muted_by(self, muted: Arc<AtomicBool>) -> Self {
        let on_next = self.on_next;
        let next_muted = Arc::clone(&muted);
        Self {
            on_next: Arc::new(move |snapshot| {
                if !next_muted.load(Ordering::SeqCst) {
                    on_next(snapshot);
                }
            }),
            on_error: self.on_error.map(|on_error| -> ErrorCallback {
                Arc::new(move |error| {
                    if !muted.load(Ordering::SeqCst) {
                        on_error(error);
                    }
                })
            }),
        }
    }

    pub fn next(&self, snapshot: ViewSnapshot) {
        (self.on_next)(snapshot);
    }

    pub fn error(&self, error: FirestoreError) {
        match &self.on_error {
            Some(on_error) => on_error(error),
            None => log::error!("Uncaught error in snapshot listener: {error}"),
        }
    }
}

pub type ListenerId = u64;

/// Decides which view snapshots a single listener gets to see.
pub struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    observer: QueryObserver,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(id: ListenerId, query: Query, options: ListenOptions, observer: QueryObserver) -> Self {
        Self {
            id,
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Returns the snapshot to deliver, if any.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> Option<ViewSnapshot> {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let mut filtered = snapshot;
            filtered
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            filtered.excludes_metadata_changes = true;
            filtered
        };

        let raised = if !self.raised_initial_event {
            self.should_raise_initial_event(&snapshot, self.online_state)
                .then(|| self.initial_event(&snapshot))
        } else if self.should_raise_event(&snapshot) {
            Some(snapshot.clone())
        } else {
            None
        };
        self.snapshot = Some(snapshot);
        raised
    }

    /// Returns the initial snapshot when going offline makes it worth raising.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        self.online_state = online_state;
        let snapshot = self.snapshot.clone()?;
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            return Some(self.initial_event(&snapshot));
        }
        None
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        // An empty result from cache is held back while the backend may still
        // answer.
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn initial_event(&mut self, snapshot: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        let mut initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        initial.excludes_metadata_changes = !self.options.include_metadata_changes;
        initial
    }
}

struct QueryListeners {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

#[derive(Default)]
struct EventManagerState {
    queries: BTreeMap<String, QueryListeners>,
    online_state: OnlineState,
}

type Delivery = (QueryObserver, ViewSnapshot);

/// Fans view snapshots out to the listeners of each query. Several
/// listeners of one query share a single view in the sync engine.
///
/// Observers are called with no lock held.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Self {
        Self {
            sync_engine,
            state: Mutex::new(EventManagerState::default()),
        }
    }

    pub fn listen(&self, mut listener: QueryListener) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let (first_listener, needs_remote) = {
            let state = self.state.lock().unwrap();
            match state.queries.get(&canonical_id) {
                Some(existing) => (
                    false,
                    listener.listens_to_remote_store()
                        && !existing
                            .listeners
                            .iter()
                            .any(QueryListener::listens_to_remote_store),
                ),
                None => (true, listener.listens_to_remote_store()),
            }
        };

        let initial = if first_listener {
            Some(
                self.sync_engine
                    .listen(listener.query().clone(), needs_remote)?,
            )
        } else {
            if needs_remote {
                self.sync_engine.listen_to_remote_store(listener.query())?;
            }
            None
        };

        let delivery = {
            let mut state = self.state.lock().unwrap();
            let online_state = state.online_state;
            let entry = state
                .queries
                .entry(canonical_id)
                .or_insert_with(|| QueryListeners {
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            if initial.is_some() {
                entry.view_snapshot = initial;
            }
            listener.apply_online_state_change(online_state);
            let raised = entry
                .view_snapshot
                .clone()
                .and_then(|snapshot| listener.on_view_snapshot(snapshot))
                .map(|snapshot| (listener.observer.clone(), snapshot));
            entry.listeners.push(listener);
            raised
        };
        if let Some((observer, snapshot)) = delivery {
            observer.next(snapshot);
        }
        Ok(())
    }

    pub fn unlisten(&self, query: &Query, listener_id: ListenerId) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let (removed, last_listener, remote_still_needed) = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let Some(position) = entry
                .listeners
                .iter()
                .position(|listener| listener.id() == listener_id)
            else {
                return Ok(());
            };
            let removed = entry.listeners.remove(position);
            let last_listener = entry.listeners.is_empty();
            let remote_still_needed = entry
                .listeners
                .iter()
                .any(QueryListener::listens_to_remote_store);
            if last_listener {
                state.queries.remove(&canonical_id);
            }
            (removed, last_listener, remote_still_needed)
        };

        if last_listener {
            self.sync_engine
                .unlisten(query, removed.listens_to_remote_store())
        } else if removed.listens_to_remote_store() && !remote_still_needed {
            self.sync_engine.unlisten_from_remote_store(query)
        } else {
            Ok(())
        }
    }

    fn deliver(deliveries: Vec<Delivery>) {
        for (observer, snapshot) in deliveries {
            observer.next(snapshot);
        }
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let deliveries: Vec<Delivery> = {
            let mut state = self.state.lock().unwrap();
            let mut deliveries = Vec::new();
            for snapshot in snapshots {
                let Some(entry) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for listener in &mut entry.listeners {
                    if let Some(raised) = listener.on_view_snapshot(snapshot.clone()) {
                        deliveries.push((listener.observer.clone(), raised));
                    }
                }
                entry.view_snapshot = Some(snapshot);
            }
            deliveries
        };
        Self::deliver(deliveries);
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = self.state.lock().unwrap().queries.remove(&query.canonical_id());
        if let Some(entry) = removed {
            for listener in entry.listeners {
                listener.observer.error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let deliveries: Vec<Delivery> = {
            let mut state = self.state.lock().unwrap();
            state.online_state = online_state;
            state
                .queries
                .values_mut()
                .flat_map(|entry| entry.listeners.iter_mut())
                .filter_map(|listener| {
                    listener
                        .apply_online_state_change(online_state)
                        .map(|snapshot| (listener.observer.clone(), snapshot))
                })
                .collect()
        };
        Self::deliver(deliveries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view_snapshot::DocumentViewChange;
    use crate::firestore::model::{DocumentKeySet, DocumentSet};
    use crate::firestore::test_support::{doc, key, query};

    fn snapshot(documents: &[&str], from_cache: bool, changes: Vec<DocumentViewChange>) -> ViewSnapshot {
        let mut set = DocumentSet::key_ordered();
        for path in documents {
            set.add(doc(path, 1, &[]));
        }
        ViewSnapshot {
            query: query("rooms"),
            old_documents: set.empty_like(),
            documents: set,
            doc_changes: changes,
            mutated_keys: DocumentKeySet::new(),
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results: false,
        }
    }

    fn listener(options: ListenOptions) -> QueryListener {
        QueryListener::new(1, query("rooms"), options, QueryObserver::new(|_| {}))
    }

    #[test]
    fn empty_cache_result_waits_for_backend_or_offline() {
        let mut listener = listener(ListenOptions::default());
        assert!(listener.on_view_snapshot(snapshot(&[], true, Vec::new())).is_none());

        let raised = listener
            .apply_online_state_change(OnlineState::Offline)
            .expect("raised once offline");
        assert!(raised.from_cache);
        assert!(listener.apply_online_state_change(OnlineState::Offline).is_none());
    }

    #[test]
    fn cache_only_listener_raises_immediately() {
        let mut listener = listener(ListenOptions::default().from_cache());
        assert!(!listener.listens_to_remote_store());
        assert!(listener.on_view_snapshot(snapshot(&[], true, Vec::new())).is_some());
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let added = DocumentViewChange::new(ChangeType::Added, doc("rooms/a", 1, &[]));
        let metadata = DocumentViewChange::new(ChangeType::Metadata, doc("rooms/a", 1, &[]));

        let mut plain = listener(ListenOptions::default());
        let initial = plain
            .on_view_snapshot(snapshot(&["rooms/a"], true, vec![added.clone()]))
            .expect("initial");
        assert_eq!(initial.doc_changes.len(), 1);
        assert!(initial.excludes_metadata_changes);
        let mut synced = snapshot(&["rooms/a"], false, vec![metadata.clone()]);
        assert!(plain.on_view_snapshot(synced.clone()).is_none());

        let mut with_metadata = listener(ListenOptions::default().with_metadata_changes());
        with_metadata.on_view_snapshot(snapshot(&["rooms/a"], true, vec![added]));
        synced.sync_state_changed = false;
        let raised = with_metadata.on_view_snapshot(synced).expect("metadata change");
        assert_eq!(raised.doc_changes, vec![metadata]);
        assert_eq!(raised.document_keys(), vec![key("rooms/a")]);
    }
}
