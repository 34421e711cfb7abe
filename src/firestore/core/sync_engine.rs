use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures::channel::oneshot;

use crate::firestore::core::{
    LimboDocumentChange, OnlineState, Query, TargetId, TargetIdGenerator, View, ViewSnapshot,
};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{ListenSequenceNumber, LocalStore, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, Mutation,
    MutationBatchResult, SnapshotVersion,
};
use crate::firestore::remote::{RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};

/// Limbo targets are never persisted, so they carry no sequence number.
const LIMBO_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Resolves when the backend acknowledges or rejects a write.
pub type WriteCompletion = oneshot::Receiver<FirestoreResult<()>>;

/// Receives the results of the sync engine. Implemented by the event manager.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected the target of `query`; the query is no longer
    /// listened to.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Where a document in limbo stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboState {
    /// Waiting for a free resolution slot.
    Pending,
    /// Listened to through its own single-document target.
    Resolving(TargetId),
    /// The resolution target turned current. A key stays resolved until no
    /// view holds it in limbo any more.
    Resolved { found: bool },
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the resolution target currently reports the document.
    received_document: bool,
}

struct LimboTracker {
    max_concurrent: usize,
    target_ids: TargetIdGenerator,
    states: BTreeMap<DocumentKey, LimboState>,
    enqueued: VecDeque<DocumentKey>,
    by_target: BTreeMap<TargetId, LimboResolution>,
    /// Targets whose views hold each key in limbo.
    references: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
}

impl LimboTracker {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            target_ids: TargetIdGenerator::for_sync_engine(),
            states: BTreeMap::new(),
            enqueued: VecDeque::new(),
            by_target: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    /// Records the limbo changes of the view of `target_id`. Returns the
    /// resolution targets that are no longer needed.
    fn track(&mut self, target_id: TargetId, changes: &[LimboDocumentChange]) -> Vec<TargetId> {
        let mut released = Vec::new();
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    log::debug!("document {key} entered limbo");
                    self.references
                        .entry(key.clone())
                        .or_default()
                        .insert(target_id);
                    if !self.states.contains_key(key) {
                        self.states.insert(key.clone(), LimboState::Pending);
                        self.enqueued.push_back(key.clone());
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} left limbo");
                    released.extend(self.remove_reference(key, target_id));
                }
            }
        }
        released
    }

    /// Drops every reference of `target_id`.
    fn remove_target(&mut self, target_id: TargetId) -> Vec<TargetId> {
        let keys: Vec<DocumentKey> = self
            .references
            .iter()
            .filter(|(_, targets)| targets.contains(&target_id))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.remove_reference(key, target_id))
            .collect()
    }

    fn remove_reference(&mut self, key: &DocumentKey, target_id: TargetId) -> Option<TargetId> {
        let unreferenced = match self.references.get_mut(key) {
            Some(targets) => {
                targets.remove(&target_id);
                targets.is_empty()
            }
            None => true,
        };
        if !unreferenced {
            return None;
        }
        self.references.remove(key);
        self.enqueued.retain(|enqueued| enqueued != key);
        match self.states.remove(key) {
            Some(LimboState::Resolving(limbo_target)) => {
                self.by_target.remove(&limbo_target);
                Some(limbo_target)
            }
            _ => None,
        }
    }

    /// Starts resolutions while slots are free. Returns the keys to listen
    /// to with their new target ids.
    fn pump(&mut self) -> Vec<(DocumentKey, TargetId)> {
        let mut started = Vec::new();
        while self.by_target.len() < self.max_concurrent {
            let Some(key) = self.enqueued.pop_front() else {
                break;
            };
            if self.states.get(&key) != Some(&LimboState::Pending) {
                continue;
            }
            let target_id = self.target_ids.next();
            self.states.insert(key.clone(), LimboState::Resolving(target_id));
            self.by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            started.push((key, target_id));
        }
        started
    }

    fn resolution_mut(&mut self, target_id: TargetId) -> Option<&mut LimboResolution> {
        self.by_target.get_mut(&target_id)
    }

    /// The resolution target of a key turned current.
    fn resolve(&mut self, target_id: TargetId) -> Option<DocumentKey> {
        let resolution = self.by_target.remove(&target_id)?;
        self.states.insert(
            resolution.key.clone(),
            LimboState::Resolved {
                found: resolution.received_document,
            },
        );
        Some(resolution.key)
    }

    /// The backend refused the resolution target: the document is treated
    /// as deleted.
    fn reject(&mut self, target_id: TargetId) -> Option<DocumentKey> {
        let resolution = self.by_target.remove(&target_id)?;
        self.states
            .insert(resolution.key.clone(), LimboState::Resolved { found: false });
        Some(resolution.key)
    }
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct SyncEngineState {
    /// Keyed by the query's canonical id.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<String>>,
    limbo: LimboTracker,
    pending_writes: BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>,
    online_state: OnlineState,
}

/// Keeps a [`View`] per listened query up to date with local writes and
/// remote events, and resolves documents the views hold in limbo.
///
/// Runs on the client's queue. No lock is held while the local or remote
/// store is called.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    listener: OnceLock<Weak<dyn SyncEngineListener>>,
    state: Mutex<SyncEngineState>,
}

type LimboUpdates = Vec<(TargetId, Vec<LimboDocumentChange>)>;

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        max_concurrent_limbo_resolutions: usize,
    ) -> Self {
        Self {
            local_store,
            remote_store,
            listener: OnceLock::new(),
            state: Mutex::new(SyncEngineState {
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                limbo: LimboTracker::new(max_concurrent_limbo_resolutions),
                pending_writes: BTreeMap::new(),
                online_state: OnlineState::Unknown,
            }),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        if self.listener.set(listener).is_err() {
            log::warn!("SyncEngine listener already set");
        }
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// Starts a view for `query` and returns its first snapshot, computed
    /// from the cache. Queries with the same target share one target id.
    pub fn listen(&self, query: Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if self.state.lock().unwrap().query_views.contains_key(&canonical_id) {
            return Err(internal_error(format!("query {canonical_id} is already listened to")));
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let (shared_current, target_listened, online_state) = {
            let state = self.state.lock().unwrap();
            let shared = state
                .queries_by_target
                .get(&target_id)
                .and_then(|ids| ids.first())
                .and_then(|id| state.query_views.get(id));
            (
                shared.is_some_and(|query_view| query_view.view.is_current()),
                shared.is_some(),
                state.online_state,
            )
        };

        let result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange {
            current: shared_current && online_state != OnlineState::Offline,
            resume_token: target_data.resume_token.clone(),
            ..TargetChange::default()
        };
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized));
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("a new view raised no snapshot"))?;

        let released = {
            let mut state = self.state.lock().unwrap();
            state.query_views.insert(
                canonical_id.clone(),
                QueryView {
                    query,
                    target_id,
                    view,
                },
            );
            state
                .queries_by_target
                .entry(target_id)
                .or_default()
                .push(canonical_id);
            state.limbo.track(target_id, &view_change.limbo_changes)
        };
        self.unlisten_limbo_targets(released)?;

        if should_listen_to_remote && !target_listened {
            self.remote_store.listen(target_data)?;
        }
        self.pump_limbo_resolutions()?;
        Ok(snapshot)
    }

    /// Drops the view of `query`. The target is released once no query uses
    /// it any more.
    pub fn unlisten(&self, query: &Query, should_unlisten_from_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let released_target = {
            let mut state = self.state.lock().unwrap();
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                log::debug!("unlisten of unknown query {canonical_id}");
                return Ok(());
            };
            let target_id = query_view.target_id;
            let unused = match state.queries_by_target.get_mut(&target_id) {
                Some(ids) => {
                    ids.retain(|id| id != &canonical_id);
                    ids.is_empty()
                }
                None => true,
            };
            if unused {
                state.queries_by_target.remove(&target_id);
            }
            unused.then_some(target_id)
        };
        let Some(target_id) = released_target else {
            return Ok(());
        };

        self.local_store.release_target(target_id)?;
        if should_unlisten_from_remote {
            self.remote_store.unlisten(target_id)?;
        }
        self.remove_limbo_references(target_id)
    }

    /// Adds the remote listen for a query whose view so far only served the
    /// cache.
    pub fn listen_to_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        self.remote_store.listen(target_data)
    }

    /// Stops the remote listen of `query` but keeps its view serving the
    /// cache.
    pub fn unlisten_from_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let target_id = self
            .state
            .lock()
            .unwrap()
            .query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id);
        match target_id {
            Some(target_id) => self.remote_store.unlisten(target_id),
            None => Ok(()),
        }
    }

    pub fn handle_credential_change(&self) -> FirestoreResult<()> {
        self.remote_store.handle_credential_change()
    }

    /// Applies `mutations` locally, raises the optimistic snapshots and hands
    /// the batch to the remote store.
    pub fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let result = self.local_store.write_locally(mutations)?;
        let batch_id = result.batch_id;
        let (sender, receiver) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .pending_writes
            .insert(batch_id, sender);

        // The batch is saved. Retrying from here would queue it twice.
        let follow_up = self
            .emit_new_snapshots(&result.changes, None)
            .and_then(|()| self.remote_store.fill_write_pipeline());
        match follow_up {
            Err(err) if err.is_transient_storage_error() => {
                log::warn!("batch {batch_id} saved, raising its snapshots failed: {err}");
                Ok(receiver)
            }
            Err(err) => Err(err),
            Ok(()) => Ok(receiver),
        }
    }

    /// State of the limbo resolution of `key`, `None` when no view holds it
    /// in limbo.
    pub fn limbo_state(&self, key: &DocumentKey) -> Option<LimboState> {
        self.state.lock().unwrap().limbo.states.get(key).copied()
    }

    /// Keys being resolved, with their resolution target ids.
    pub fn active_limbo_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state
            .lock()
            .unwrap()
            .limbo
            .by_target
            .iter()
            .map(|(target_id, resolution)| (resolution.key.clone(), *target_id))
            .collect()
    }

    fn emit_new_snapshots(
        &self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        // Views are taken out so the lock is free while the local store runs
        // refill queries.
        let mut views = std::mem::take(&mut self.state.lock().unwrap().query_views);
        let outcome = self.apply_to_views(&mut views, changes, remote_event);
        self.state.lock().unwrap().query_views = views;
        let (snapshots, limbo_updates) = outcome?;

        let released: Vec<TargetId> = {
            let mut state = self.state.lock().unwrap();
            limbo_updates
                .iter()
                .flat_map(|(target_id, limbo_changes)| state.limbo.track(*target_id, limbo_changes))
                .collect()
        };
        self.unlisten_limbo_targets(released)?;
        self.pump_limbo_resolutions()?;

        if !snapshots.is_empty() {
            if let Some(listener) = self.listener() {
                listener.on_watch_change(snapshots);
            }
        }
        Ok(())
    }

    fn apply_to_views(
        &self,
        views: &mut BTreeMap<String, QueryView>,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<(Vec<ViewSnapshot>, LimboUpdates)> {
        let mut snapshots = Vec::new();
        let mut limbo_updates = Vec::new();
        for query_view in views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                let refreshed = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&refreshed.documents, Some(doc_changes));
            }
            let target_change =
                remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let view_change = query_view.view.apply_changes(doc_changes, true, target_change);
            if !view_change.limbo_changes.is_empty() {
                limbo_updates.push((query_view.target_id, view_change.limbo_changes));
            }
            if let Some(snapshot) = view_change.snapshot {
                snapshots.push(snapshot);
            }
        }
        Ok((snapshots, limbo_updates))
    }

    fn pump_limbo_resolutions(&self) -> FirestoreResult<()> {
        let started = self.state.lock().unwrap().limbo.pump();
        for (key, target_id) in started {
            log::debug!("resolving limbo document {key} with target {target_id}");
            let target = Query::for_document(&key).to_target();
            self.remote_store.listen(TargetData::new(
                target,
                target_id,
                TargetPurpose::LimboResolution,
                LIMBO_SEQUENCE_NUMBER,
            ))?;
        }
        Ok(())
    }

    fn unlisten_limbo_targets(&self, target_ids: Vec<TargetId>) -> FirestoreResult<()> {
        for target_id in target_ids {
            self.remote_store.unlisten(target_id)?;
        }
        Ok(())
    }

    fn remove_limbo_references(&self, target_id: TargetId) -> FirestoreResult<()> {
        let released = self.state.lock().unwrap().limbo.remove_target(target_id);
        self.unlisten_limbo_targets(released)?;
        self.pump_limbo_resolutions()
    }

    /// Fails every write still waiting for the backend. The batches stay in
    /// the mutation queue.
    pub fn cancel_pending_writes(&self) {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending_writes);
        for (_, sender) in pending {
            let _ = sender.send(Err(cancelled("The client was terminated")));
        }
    }

    fn complete_write(&self, batch_id: BatchId, result: FirestoreResult<()>) {
        let sender = self.state.lock().unwrap().pending_writes.remove(&batch_id);
        match sender {
            // The caller may have stopped waiting.
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => log::debug!("no pending write for batch {batch_id}"),
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut current_limbo_targets = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.limbo.resolution_mut(*target_id) else {
                    continue;
                };
                let touched = change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len();
                if touched > 1 {
                    return Err(internal_error(
                        "a limbo resolution target reported more than one document",
                    ));
                }
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error(
                            "a limbo resolution target modified a document it never added",
                        ));
                    }
                } else if !change.removed_documents.is_empty() {
                    resolution.received_document = false;
                }
                if change.current {
                    current_limbo_targets.push(*target_id);
                }
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snapshots(&changes, Some(&event))?;

        let resolved: Vec<TargetId> = {
            let mut state = self.state.lock().unwrap();
            current_limbo_targets
                .into_iter()
                .filter(|target_id| state.limbo.resolve(*target_id).is_some())
                .collect()
        };
        self.unlisten_limbo_targets(resolved)?;
        self.pump_limbo_resolutions()
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = self.state.lock().unwrap().limbo.reject(target_id);
        if let Some(key) = limbo_key {
            log::debug!("limbo resolution of {key} rejected: {error}");
            let mut document_updates = DocumentMap::new();
            document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                target_changes: BTreeMap::new(),
                target_mismatches: BTreeMap::new(),
                document_updates,
                resolved_limbo_documents: DocumentKeySet::from([key]),
            };
            return self.apply_remote_event(event);
        }

        let queries: Vec<Query> = {
            let mut state = self.state.lock().unwrap();
            let ids = state.queries_by_target.remove(&target_id).unwrap_or_default();
            ids.iter()
                .filter_map(|id| state.query_views.remove(id))
                .map(|query_view| query_view.query)
                .collect()
        };
        if queries.is_empty() {
            return Ok(());
        }
        log::warn!("listen to target {target_id} rejected: {error}");
        self.local_store.release_target(target_id)?;
        self.remove_limbo_references(target_id)?;
        if let Some(listener) = self.listener() {
            for query in &queries {
                listener.on_watch_error(query, error.clone());
            }
        }
        Ok(())
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id();
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.emit_new_snapshots(&changes, None)?;
        self.complete_write(batch_id, Ok(()));
        Ok(())
    }

    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.emit_new_snapshots(&changes, None)?;
        self.complete_write(batch_id, Err(error));
        Ok(())
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        let mut views = std::mem::take(&mut self.state.lock().unwrap().query_views);
        let snapshots: Vec<ViewSnapshot> = views
            .values_mut()
            .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
            .collect();
        {
            let mut state = self.state.lock().unwrap();
            state.query_views = views;
            state.online_state = online_state;
        }

        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            if !snapshots.is_empty() {
                listener.on_watch_change(snapshots);
            }
        }
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.state.lock().unwrap();
        if let Some(resolution) = state.limbo.by_target.get(&target_id) {
            return if resolution.received_document {
                DocumentKeySet::from([resolution.key.clone()])
            } else {
                DocumentKeySet::new()
            };
        }
        state
            .queries_by_target
            .get(&target_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.query_views.get(id))
            .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
            .collect()
    }
}
