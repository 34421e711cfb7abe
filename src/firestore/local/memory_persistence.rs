use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};

use crate::firestore::core::{Query, Target, TargetId, TargetIdGenerator};
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::persistence::{
    DocumentOverlayCache, MutationQueue, Persistence, PersistenceTransaction, RemoteDocumentCache,
    TargetCache, TransactionBody, UndoAction,
};
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, Mutation, MutationBatch,
    Overlay, ResourcePath, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Captures the state behind `state` the first time `store` is written in
/// the transaction, and restores it on rollback.
fn journal<S>(txn: &mut PersistenceTransaction, store: &'static str, state: &Arc<StdMutex<S>>)
where
    S: Clone + Send + 'static,
{
    let state = Arc::clone(state);
    txn.record_undo_once(store, move || -> UndoAction {
        let saved = state.lock().unwrap().clone();
        Box::new(move || *state.lock().unwrap() = saved)
    });
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MutationQueueState {
    batches: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
}

impl Default for MutationQueueState {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct MemoryMutationQueue {
    state: Arc<StdMutex<MutationQueueState>>,
}

impl MemoryMutationQueue {
    fn batches_where<F>(&self, predicate: F) -> Vec<MutationBatch>
    where
        F: Fn(&MutationBatch) -> bool,
    {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .filter(|batch| predicate(batch))
            .cloned()
            .collect()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self, _txn: &mut PersistenceTransaction) -> FirestoreResult<bool> {
        Ok(self.state.lock().unwrap().batches.is_empty())
    }

    fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        journal(txn, "mutation_queue", &self.state);
        let mut state = self.state.lock().unwrap();
        let batch = MutationBatch::new(state.next_batch_id, local_write_time, mutations);
        state.next_batch_id += 1;
        state.batches.push(batch.clone());
        Ok(batch)
    }

    fn lookup_mutation_batch(
        &self,
        _txn: &mut PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .batches
            .iter()
            .find(|batch| batch.batch_id() == batch_id)
            .cloned())
    }

    fn next_mutation_batch_after_batch_id(
        &self,
        _txn: &mut PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .batches
            .iter()
            .find(|batch| batch.batch_id() > batch_id)
            .cloned())
    }

    fn highest_unacknowledged_batch_id(
        &self,
        _txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<BatchId> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .batches
            .last()
            .map(MutationBatch::batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    fn all_mutation_batches(
        &self,
        _txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self.state.lock().unwrap().batches.clone())
    }

    fn all_mutation_batches_affecting_document_key(
        &self,
        _txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self.batches_where(|batch| batch.touches(key)))
    }

    fn all_mutation_batches_affecting_document_keys(
        &self,
        _txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self.batches_where(|batch| {
            batch
                .mutations()
                .iter()
                .any(|mutation| keys.contains(mutation.key()))
        }))
    }

    fn all_mutation_batches_affecting_query(
        &self,
        _txn: &mut PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let path = query.path().clone();
        let document_query = query.is_document_query();
        let group = query.collection_group_id().map(str::to_string);
        Ok(self.batches_where(|batch| {
            batch.mutations().iter().any(|mutation| {
                let key_path = mutation.key().path();
                match &group {
                    Some(group) => {
                        mutation.key().has_collection_id(group) && path.is_prefix_of(key_path)
                    }
                    None if document_query => &path == key_path,
                    None => path.is_immediate_parent_of(key_path),
                }
            })
        }))
    }

    fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let head = self
            .state
            .lock()
            .unwrap()
            .batches
            .first()
            .map(MutationBatch::batch_id);
        if head != Some(batch.batch_id()) {
            return Err(failed_precondition(format!(
                "Can only remove the first entry of the mutation queue (batch {}, head {:?})",
                batch.batch_id(),
                head
            )));
        }
        journal(txn, "mutation_queue", &self.state);
        self.state.lock().unwrap().batches.remove(0);
        Ok(())
    }

    fn last_stream_token(&self, _txn: &mut PersistenceTransaction) -> FirestoreResult<Vec<u8>> {
        Ok(self.state.lock().unwrap().last_stream_token.clone())
    }

    fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction,
        token: Vec<u8>,
    ) -> FirestoreResult<()> {
        journal(txn, "mutation_queue", &self.state);
        self.state.lock().unwrap().last_stream_token = token;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct OverlayState {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch: BTreeMap<BatchId, DocumentKeySet>,
}

impl OverlayState {
    fn put(&mut self, overlay: Overlay) {
        let key = overlay.key().clone();
        self.remove(&key);
        self.keys_by_batch
            .entry(overlay.largest_batch_id())
            .or_default()
            .insert(key.clone());
        self.overlays.insert(key, overlay);
    }

    fn remove(&mut self, key: &DocumentKey) {
        let Some(previous) = self.overlays.remove(key) else {
            return;
        };
        if let Some(keys) = self.keys_by_batch.get_mut(&previous.largest_batch_id()) {
            keys.remove(key);
            if keys.is_empty() {
                self.keys_by_batch.remove(&previous.largest_batch_id());
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryDocumentOverlayCache {
    state: Arc<StdMutex<OverlayState>>,
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(
        &self,
        _txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>> {
        Ok(self.state.lock().unwrap().overlays.get(key).cloned())
    }

    fn get_overlays(
        &self,
        _txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .overlays
                    .get(key)
                    .map(|overlay| (key.clone(), overlay.clone()))
            })
            .collect())
    }

    fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        journal(txn, "document_overlays", &self.state);
        let mut state = self.state.lock().unwrap();
        for (_, mutation) in overlays {
            state.put(Overlay::new(largest_batch_id, mutation));
        }
        Ok(())
    }

    fn remove_overlay(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        journal(txn, "document_overlays", &self.state);
        self.state.lock().unwrap().remove(key);
        Ok(())
    }

    fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        batch_id: BatchId,
    ) -> FirestoreResult<()> {
        journal(txn, "document_overlays", &self.state);
        let mut state = self.state.lock().unwrap();
        let tagged: Vec<DocumentKey> = state
            .keys_by_batch
            .get(&batch_id)
            .map(|tagged| tagged.intersection(keys).cloned().collect())
            .unwrap_or_default();
        for key in tagged {
            state.remove(&key);
        }
        Ok(())
    }

    fn get_overlays_for_collection(
        &self,
        _txn: &mut PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path())
                    && overlay.largest_batch_id() > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryRemoteDocumentCache {
    state: Arc<StdMutex<DocumentMap>>,
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(
        &self,
        txn: &mut PersistenceTransaction,
        mut document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        journal(txn, "remote_documents", &self.state);
        document.set_read_time(read_time);
        self.state
            .lock()
            .unwrap()
            .insert(document.key().clone(), document);
        Ok(())
    }

    fn remove_entry(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        journal(txn, "remote_documents", &self.state);
        self.state.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_entry(
        &self,
        _txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone())))
    }

    fn get_entries(
        &self,
        _txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .map(|key| {
                let document = state
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));
                (key.clone(), document)
            })
            .collect())
    }

    fn get_documents_matching_query(
        &self,
        _txn: &mut PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, document)| query.matches(document))
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect())
    }
}

#[derive(Clone, Debug, Default)]
struct TargetState {
    targets: BTreeMap<TargetId, TargetData>,
    ids_by_canonical_id: HashMap<String, TargetId>,
    matching_keys: BTreeMap<TargetId, DocumentKeySet>,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
}

impl TargetState {
    fn save(&mut self, target_data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(target_data.target_id);
        self.highest_sequence_number = self
            .highest_sequence_number
            .max(target_data.sequence_number);
        self.ids_by_canonical_id
            .insert(target_data.target.canonical_id(), target_data.target_id);
        self.targets.insert(target_data.target_id, target_data);
    }
}

#[derive(Default)]
pub struct MemoryTargetCache {
    state: Arc<StdMutex<TargetState>>,
}

impl TargetCache for MemoryTargetCache {
    fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: TargetData,
    ) -> FirestoreResult<()> {
        journal(txn, "targets", &self.state);
        self.state.lock().unwrap().save(target_data);
        Ok(())
    }

    fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: TargetData,
    ) -> FirestoreResult<()> {
        self.add_target_data(txn, target_data)
    }

    fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        journal(txn, "targets", &self.state);
        let mut state = self.state.lock().unwrap();
        if let Some(removed) = state.targets.remove(&target_id) {
            state
                .ids_by_canonical_id
                .remove(&removed.target.canonical_id());
        }
        state.matching_keys.remove(&target_id);
        Ok(())
    }

    fn get_target_data(
        &self,
        _txn: &mut PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|id| state.targets.get(id))
            .cloned())
    }

    fn allocate_target_id(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<TargetId> {
        journal(txn, "targets", &self.state);
        let mut state = self.state.lock().unwrap();
        let target_id = TargetIdGenerator::for_target_cache(state.highest_target_id).next();
        state.highest_target_id = target_id;
        Ok(target_id)
    }

    fn highest_target_id(&self, _txn: &mut PersistenceTransaction) -> FirestoreResult<TargetId> {
        Ok(self.state.lock().unwrap().highest_target_id)
    }

    fn next_sequence_number(
        &self,
        txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<ListenSequenceNumber> {
        journal(txn, "targets", &self.state);
        let mut state = self.state.lock().unwrap();
        state.highest_sequence_number += 1;
        Ok(state.highest_sequence_number)
    }

    fn last_remote_snapshot_version(
        &self,
        _txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(self.state.lock().unwrap().last_remote_snapshot_version)
    }

    fn set_last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction,
        version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        journal(txn, "targets", &self.state);
        self.state.lock().unwrap().last_remote_snapshot_version = version;
        Ok(())
    }

    fn add_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        journal(txn, "targets", &self.state);
        self.state
            .lock()
            .unwrap()
            .matching_keys
            .entry(target_id)
            .or_default()
            .extend(keys.iter().cloned());
        Ok(())
    }

    fn remove_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        journal(txn, "targets", &self.state);
        if let Some(existing) = self.state.lock().unwrap().matching_keys.get_mut(&target_id) {
            existing.retain(|key| !keys.contains(key));
        }
        Ok(())
    }

    fn matching_keys_for_target_id(
        &self,
        _txn: &mut PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<DocumentKeySet> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .matching_keys
            .get(&target_id)
            .cloned()
            .unwrap_or_default())
    }

    fn contains_key(
        &self,
        _txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .matching_keys
            .values()
            .any(|keys| keys.contains(key)))
    }
}

/// Flat form of the whole store contents, used by the durable backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct PersistedState {
    pub mutation_queue: MutationQueueState,
    pub overlays: Vec<Overlay>,
    pub remote_documents: Vec<MutableDocument>,
    pub targets: Vec<TargetData>,
    pub matching_keys: Vec<(TargetId, Vec<DocumentKey>)>,
    pub highest_target_id: TargetId,
    pub highest_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
}

/// Persistence backed by process memory. Nothing survives the process.
pub struct MemoryPersistence {
    mutation_queue: Arc<MemoryMutationQueue>,
    overlays: Arc<MemoryDocumentOverlayCache>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    targets: Arc<MemoryTargetCache>,
    transaction_lock: StdMutex<()>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::from_state(PersistedState::default())
    }

    pub(crate) fn from_state(persisted: PersistedState) -> Self {
        let mut overlays = OverlayState::default();
        for overlay in persisted.overlays {
            overlays.put(overlay);
        }

        let mut targets = TargetState::default();
        for target_data in persisted.targets {
            targets.save(target_data);
        }
        targets.matching_keys = persisted
            .matching_keys
            .into_iter()
            .map(|(target_id, keys)| (target_id, keys.into_iter().collect()))
            .collect();
        targets.highest_target_id = targets.highest_target_id.max(persisted.highest_target_id);
        targets.highest_sequence_number = targets
            .highest_sequence_number
            .max(persisted.highest_sequence_number);
        targets.last_remote_snapshot_version = persisted.last_remote_snapshot_version;

        let remote_documents = persisted
            .remote_documents
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();

        Self {
            mutation_queue: Arc::new(MemoryMutationQueue {
                state: Arc::new(StdMutex::new(persisted.mutation_queue)),
            }),
            overlays: Arc::new(MemoryDocumentOverlayCache {
                state: Arc::new(StdMutex::new(overlays)),
            }),
            remote_documents: Arc::new(MemoryRemoteDocumentCache {
                state: Arc::new(StdMutex::new(remote_documents)),
            }),
            targets: Arc::new(MemoryTargetCache {
                state: Arc::new(StdMutex::new(targets)),
            }),
            transaction_lock: StdMutex::new(()),
        }
    }

    pub(crate) fn export_state(&self) -> PersistedState {
        let targets = self.targets.state.lock().unwrap().clone();
        PersistedState {
            mutation_queue: self.mutation_queue.state.lock().unwrap().clone(),
            overlays: self
                .overlays
                .state
                .lock()
                .unwrap()
                .overlays
                .values()
                .cloned()
                .collect(),
            remote_documents: self
                .remote_documents
                .state
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect(),
            targets: targets.targets.into_values().collect(),
            matching_keys: targets
                .matching_keys
                .into_iter()
                .map(|(target_id, keys)| (target_id, keys.into_iter().collect()))
                .collect(),
            highest_target_id: targets.highest_target_id,
            highest_sequence_number: targets.highest_sequence_number,
            last_remote_snapshot_version: targets.last_remote_snapshot_version,
        }
    }

    /// Runs `body` in a transaction, then `on_commit` while the transaction
    /// can still be rolled back. Used by the durable backend to flush.
    pub(crate) fn run_transaction_with<C>(
        &self,
        action: &str,
        body: &mut TransactionBody<'_>,
        on_commit: C,
    ) -> FirestoreResult<()>
    where
        C: FnOnce(&Self) -> FirestoreResult<()>,
    {
        let _guard = self.transaction_lock.lock().unwrap();
        let mut txn = PersistenceTransaction::new(action);
        match body(&mut txn).and_then(|()| on_commit(self)) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(err) => {
                log::debug!("transaction '{action}' failed: {err}");
                txn.rollback();
                Err(err)
            }
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl Persistence for MemoryPersistence {
    fn mutation_queue(&self) -> Arc<dyn MutationQueue> {
        self.mutation_queue.clone()
    }

    fn document_overlay_cache(&self) -> Arc<dyn DocumentOverlayCache> {
        self.overlays.clone()
    }

    fn remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache> {
        self.remote_documents.clone()
    }

    fn target_cache(&self) -> Arc<dyn TargetCache> {
        self.targets.clone()
    }

    fn run_transaction(&self, action: &str, body: &mut TransactionBody<'_>) -> FirestoreResult<()> {
        self.run_transaction_with(action, body, |_| Ok(()))
    }
}
