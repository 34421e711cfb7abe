use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::core::{Query, Target, TargetId};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::{
    DocumentOverlayCache, MutationQueue, Persistence, PersistenceTransaction, RemoteDocumentCache,
    TargetCache,
};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::RemoteEvent;

#[derive(Debug, Clone)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported as matching the query's target.
    pub remote_keys: DocumentKeySet,
}

#[derive(Default)]
struct ActiveTargets {
    by_target_id: BTreeMap<TargetId, TargetData>,
    ids_by_canonical_id: HashMap<String, TargetId>,
}

/// Local view of the database: remote documents, pending writes and the
/// targets being listened to.
///
/// Every operation runs in a single persistence transaction, so a failure
/// leaves the stores untouched. Callers serialize access through the async
/// queue.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    mutation_queue: Arc<dyn MutationQueue>,
    remote_documents: Arc<dyn RemoteDocumentCache>,
    overlays: Arc<dyn DocumentOverlayCache>,
    target_cache: Arc<dyn TargetCache>,
    local_documents: Arc<LocalDocumentsView>,
    query_engine: QueryEngine,
    active_targets: StdMutex<ActiveTargets>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        let local_documents = Arc::new(LocalDocumentsView::new(persistence.as_ref()));
        Self {
            mutation_queue: persistence.mutation_queue(),
            remote_documents: persistence.remote_document_cache(),
            overlays: persistence.document_overlay_cache(),
            target_cache: persistence.target_cache(),
            query_engine: QueryEngine::new(Arc::clone(&local_documents)),
            local_documents,
            persistence,
            active_targets: StdMutex::new(ActiveTargets::default()),
        }
    }

    fn run<T, F>(&self, action: &str, body: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction) -> FirestoreResult<T>,
    {
        let mut body = Some(body);
        let mut output = None;
        self.persistence.run_transaction(action, &mut |txn| {
            let body = body
                .take()
                .ok_or_else(|| internal_error("transaction body ran twice"))?;
            output = Some(body(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("transaction '{action}' produced no result")))
    }

    /// Queues `mutations` as one batch and returns the new local view of the
    /// documents it touches.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        self.run("Locally write mutations", |txn| {
            let batch = self
                .mutation_queue
                .add_mutation_batch(txn, local_write_time, mutations)?;
            let keys = batch.keys();
            self.local_documents.recalculate_and_save_overlays(txn, &keys)?;
            let changes = self.local_documents.get_documents(txn, &keys)?;
            Ok(LocalWriteResult {
                batch_id: batch.batch_id(),
                changes,
            })
        })
    }

    /// Applies an acknowledged batch to the remote documents, removes it from
    /// the queue and persists the new stream token.
    pub fn acknowledge_batch(&self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.run("Acknowledge batch", |txn| {
            let batch = &result.batch;
            let keys = batch.keys();
            let mut documents = self.remote_documents.get_entries(txn, &keys)?;
            for key in &keys {
                let ack_version = result.doc_versions.get(key).copied().ok_or_else(|| {
                    internal_error(format!("write result for {key} is missing its version"))
                })?;
                let Some(document) = documents.get_mut(key) else {
                    continue;
                };
                if document.version() < ack_version {
                    batch.apply_to_remote_document(document, result)?;
                    if document.is_valid_document() {
                        self.remote_documents
                            .add_entry(txn, document.clone(), result.commit_version)?;
                    }
                }
            }

            self.mutation_queue.remove_mutation_batch(txn, batch)?;
            self.overlays
                .remove_overlays_for_batch_id(txn, &keys, batch.batch_id())?;
            self.mutation_queue
                .set_last_stream_token(txn, result.stream_token.clone())?;
            self.local_documents.recalculate_and_save_overlays(txn, &keys)?;
            self.local_documents.get_documents(txn, &keys)
        })
    }

    /// Drops a batch the backend refused and returns the documents it touched
    /// as they look without it.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        self.run("Reject batch", |txn| {
            let batch = self
                .mutation_queue
                .lookup_mutation_batch(txn, batch_id)?
                .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
            let keys = batch.keys();
            self.mutation_queue.remove_mutation_batch(txn, &batch)?;
            self.overlays
                .remove_overlays_for_batch_id(txn, &keys, batch_id)?;
            self.local_documents.recalculate_and_save_overlays(txn, &keys)?;
            self.local_documents.get_documents(txn, &keys)
        })
    }

    /// Persists a remote event and returns the local view of every document
    /// it changed.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let (updated_targets, documents) = self.run("Apply remote event", |txn| {
            let mut updated_targets = Vec::new();
            for (target_id, change) in &event.target_changes {
                let Some(old) = self.active_target(*target_id) else {
                    continue;
                };
                self.target_cache
                    .remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                self.target_cache
                    .add_matching_keys(txn, &change.added_documents, *target_id)?;

                let sequence_number = self.target_cache.next_sequence_number(txn)?;
                let mut updated = old.with_sequence_number(sequence_number);
                if event.target_mismatches.contains_key(target_id) {
                    updated = updated
                        .with_resume_token(Vec::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                }
                self.target_cache.update_target_data(txn, updated.clone())?;
                updated_targets.push(updated);
            }

            let changed = self.apply_document_updates(txn, &event.document_updates, remote_version)?;

            if !remote_version.is_min() {
                let last = self.target_cache.last_remote_snapshot_version(txn)?;
                if remote_version < last {
                    return Err(internal_error(format!(
                        "Watch stream reverted to a previous snapshot ({remote_version} < {last})"
                    )));
                }
                self.target_cache
                    .set_last_remote_snapshot_version(txn, remote_version)?;
            }

            let changed_keys: DocumentKeySet = changed.keys().cloned().collect();
            let documents = self.local_documents.get_documents(txn, &changed_keys)?;
            Ok((updated_targets, documents))
        })?;

        let mut active = self.active_targets.lock().unwrap();
        for target_data in updated_targets {
            if active.by_target_id.contains_key(&target_data.target_id) {
                active.by_target_id.insert(target_data.target_id, target_data);
            }
        }
        Ok(documents)
    }

    fn apply_document_updates(
        &self,
        txn: &mut PersistenceTransaction,
        updates: &DocumentMap,
        remote_version: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let keys: DocumentKeySet = updates.keys().cloned().collect();
        let existing = self.remote_documents.get_entries(txn, &keys)?;
        let pending: DocumentKeySet = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(txn, &keys)?
            .iter()
            .flat_map(MutationBatch::keys)
            .filter(|key| keys.contains(key))
            .collect();

        let mut changed = DocumentMap::new();
        for (key, document) in updates {
            let cached = existing
                .get(key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));

            // Pending writes do not block the cache update. Their overlays
            // are recalculated below and keep shadowing the new base.
            if document.is_no_document() && document.version().is_min() {
                self.remote_documents.remove_entry(txn, key)?;
                changed.insert(key.clone(), document.clone());
            } else if !cached.is_valid_document()
                || document.version() > cached.version()
                || (document.version() == cached.version() && cached.has_pending_writes())
            {
                self.remote_documents
                    .add_entry(txn, document.clone(), remote_version)?;
                changed.insert(key.clone(), document.clone());
            } else {
                log::debug!(
                    "Ignoring outdated watch update for {key}. Current version: {}, watch version: {}",
                    cached.version(),
                    document.version()
                );
            }
        }

        let recalculate: DocumentKeySet = changed
            .keys()
            .filter(|key| pending.contains(*key))
            .cloned()
            .collect();
        self.local_documents
            .recalculate_and_save_overlays(txn, &recalculate)?;
        Ok(changed)
    }

    fn active_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.active_targets
            .lock()
            .unwrap()
            .by_target_id
            .get(&target_id)
            .cloned()
    }

    /// Assigns a target id to `target`, reusing the persisted one when the
    /// target was listened to before.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let canonical_id = target.canonical_id();
        {
            let active = self.active_targets.lock().unwrap();
            if let Some(existing) = active
                .ids_by_canonical_id
                .get(&canonical_id)
                .and_then(|id| active.by_target_id.get(id))
            {
                return Ok(existing.clone());
            }
        }

        let target_data = self.run("Allocate target", |txn| {
            if let Some(cached) = self.target_cache.get_target_data(txn, &target)? {
                return Ok(cached);
            }
            let target_id = self.target_cache.allocate_target_id(txn)?;
            let sequence_number = self.target_cache.next_sequence_number(txn)?;
            let target_data =
                TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number);
            self.target_cache.add_target_data(txn, target_data.clone())?;
            Ok(target_data)
        })?;

        let mut active = self.active_targets.lock().unwrap();
        active
            .ids_by_canonical_id
            .insert(canonical_id, target_data.target_id);
        active
            .by_target_id
            .insert(target_data.target_id, target_data.clone());
        Ok(target_data)
    }

    /// Stops tracking `target_id` as active. Its persisted data and remote
    /// keys are kept so a later listen can resume.
    pub fn release_target(&self, target_id: TargetId) -> FirestoreResult<()> {
        let released = {
            let mut active = self.active_targets.lock().unwrap();
            let released = active.by_target_id.remove(&target_id);
            if let Some(released) = &released {
                active
                    .ids_by_canonical_id
                    .remove(&released.target.canonical_id());
            }
            released
        };
        let Some(released) = released else {
            log::debug!("release of inactive target {target_id} ignored");
            return Ok(());
        };
        self.run("Release target", |txn| {
            self.target_cache.update_target_data(txn, released)
        })
    }

    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        {
            let active = self.active_targets.lock().unwrap();
            if let Some(existing) = active
                .ids_by_canonical_id
                .get(&target.canonical_id())
                .and_then(|id| active.by_target_id.get(id))
            {
                return Ok(Some(existing.clone()));
            }
        }
        self.run("Get target data", |txn| {
            self.target_cache.get_target_data(txn, target)
        })
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.run("Read document", |txn| {
            self.local_documents.get_document(txn, key)
        })
    }

    pub fn get_documents(&self, keys: &DocumentKeySet) -> FirestoreResult<DocumentMap> {
        self.run("Get documents", |txn| {
            self.local_documents.get_documents(txn, keys)
        })
    }

    /// Runs `query` against the cache. With `use_previous_results` the remote
    /// keys of the query's target are returned alongside the documents.
    pub fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target())?;
        self.run("Execute query", |txn| {
            let remote_keys = match (&target_data, use_previous_results) {
                (Some(target_data), true) => self
                    .target_cache
                    .matching_keys_for_target_id(txn, target_data.target_id)?,
                _ => DocumentKeySet::new(),
            };
            let documents = self
                .query_engine
                .get_documents_matching_query(txn, query, &remote_keys)?;
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        self.run("Remote document keys", |txn| {
            self.target_cache.matching_keys_for_target_id(txn, target_id)
        })
    }

    /// Oldest pending batch with an id greater than `after_batch_id`, or the
    /// oldest pending batch when `None`.
    pub fn next_mutation_batch(
        &self,
        after_batch_id: Option<BatchId>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.run("Get next mutation batch", |txn| {
            self.mutation_queue
                .next_mutation_batch_after_batch_id(txn, after)
        })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.run("Get highest unacknowledged batch id", |txn| {
            self.mutation_queue.highest_unacknowledged_batch_id(txn)
        })
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.run("Get last remote snapshot version", |txn| {
            self.target_cache.last_remote_snapshot_version(txn)
        })
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.run("Get last stream token", |txn| {
            self.mutation_queue.last_stream_token(txn)
        })
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()> {
        self.run("Set last stream token", |txn| {
            self.mutation_queue.set_last_stream_token(txn, token)
        })
    }

    pub fn shutdown(&self) {
        self.persistence.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::model::MutationResult;
    use crate::firestore::remote::TargetChange;
    use crate::firestore::test_support::{deleted_doc, doc, field, key, map, query, version};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from(value)
    }

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(MemoryPersistence::new()))
    }

    fn ack(store: &LocalStore, batch_id: BatchId, commit_seconds: i64) -> DocumentMap {
        let batch = store
            .next_mutation_batch(Some(batch_id - 1))
            .unwrap()
            .expect("pending batch");
        assert_eq!(batch.batch_id(), batch_id);
        let results = batch
            .mutations()
            .iter()
            .map(|_| MutationResult::new(version(commit_seconds), Vec::new()))
            .collect();
        let result =
            MutationBatchResult::from(batch, version(commit_seconds), results, b"token".to_vec())
                .unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    fn remote_event(
        target_id: TargetId,
        seconds: i64,
        documents: Vec<MutableDocument>,
    ) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: format!("resume-{seconds}").into_bytes(),
            current: true,
            ..TargetChange::default()
        };
        let mut event = RemoteEvent {
            snapshot_version: version(seconds),
            ..RemoteEvent::default()
        };
        for document in documents {
            if document.is_found_document() {
                change.added_documents.insert(document.key().clone());
            } else {
                change.removed_documents.insert(document.key().clone());
            }
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    fn data(document: &MutableDocument) -> &MapValue {
        document.data()
    }

    #[test]
    fn set_then_patch_keeps_overlay_across_first_ack() {
        let store = store();
        let first = store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(&[("a", int(1))]))])
            .unwrap();
        let second = store
            .write_locally(vec![Mutation::patch(key("rooms/a"), map(&[("b", int(2))]))])
            .unwrap();
        let expected = map(&[("a", int(1)), ("b", int(2))]);
        assert_eq!(data(&second.changes[&key("rooms/a")]), &expected);

        let after_ack = ack(&store, first.batch_id, 10);
        let document = &after_ack[&key("rooms/a")];
        assert_eq!(data(document), &expected);
        assert!(document.has_local_mutations());

        let after_second_ack = ack(&store, second.batch_id, 11);
        let document = &after_second_ack[&key("rooms/a")];
        assert_eq!(data(document), &expected);
        assert!(document.has_committed_mutations());
        assert_eq!(store.last_stream_token().unwrap(), b"token".to_vec());
    }

    #[test]
    fn rejecting_a_batch_restores_the_remote_view() {
        let store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(
                target.target_id,
                1,
                vec![doc("rooms/a", 1, &[("a", int(1))])],
            ))
            .unwrap();
        let write = store
            .write_locally(vec![Mutation::patch(key("rooms/a"), map(&[("a", int(2))]))])
            .unwrap();
        assert_eq!(data(&write.changes[&key("rooms/a")]), &map(&[("a", int(2))]));

        let rejected = store.reject_batch(write.batch_id).unwrap();
        let document = &rejected[&key("rooms/a")];
        assert_eq!(data(document), &map(&[("a", int(1))]));
        assert!(!document.has_local_mutations());
    }

    #[test]
    fn only_the_oldest_batch_can_be_acknowledged() {
        let store = store();
        store
            .write_locally(vec![Mutation::set(key("rooms/a"), MapValue::empty())])
            .unwrap();
        let second = store
            .write_locally(vec![Mutation::set(key("rooms/b"), MapValue::empty())])
            .unwrap();
        let batch = store
            .next_mutation_batch(Some(second.batch_id - 1))
            .unwrap()
            .unwrap();
        let result = MutationBatchResult::from(
            batch,
            version(5),
            vec![MutationResult::new(version(5), Vec::new())],
            Vec::new(),
        )
        .unwrap();
        let err = store.acknowledge_batch(&result).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), second.batch_id);
        assert!(store
            .read_document(&key("rooms/b"))
            .unwrap()
            .has_local_mutations());
    }

    #[test]
    fn remote_updates_respect_versions_and_pending_writes() {
        let store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        let target_id = target.target_id;
        store
            .apply_remote_event(&remote_event(target_id, 2, vec![doc("rooms/a", 2, &[("v", int(2))])]))
            .unwrap();

        let stale = store
            .apply_remote_event(&remote_event(target_id, 3, vec![doc("rooms/a", 1, &[("v", int(1))])]))
            .unwrap();
        assert!(stale.is_empty());
        assert_eq!(
            data(&store.read_document(&key("rooms/a")).unwrap()),
            &map(&[("v", int(2))])
        );

        store
            .write_locally(vec![Mutation::patch(key("rooms/a"), map(&[("mine", int(1))]))])
            .unwrap();
        let shadowed = store
            .apply_remote_event(&remote_event(target_id, 4, vec![doc("rooms/a", 4, &[("v", int(4))])]))
            .unwrap();
        let changed = &shadowed[&key("rooms/a")];
        assert!(changed.has_local_mutations());
        assert_eq!(changed.field(&field("v")), Some(&int(4)));
        assert_eq!(changed.field(&field("mine")), Some(&int(1)));

        let remote = store
            .run("Read remote document", |txn| {
                store.remote_documents.get_entry(txn, &key("rooms/a"))
            })
            .unwrap();
        assert_eq!(remote.version(), version(4));
        assert_eq!(remote.field(&field("mine")), None);

        let local = store.read_document(&key("rooms/a")).unwrap();
        assert!(local.has_local_mutations());
        assert_eq!(local.field(&field("v")), Some(&int(4)));
        assert_eq!(local.field(&field("mine")), Some(&int(1)));

        assert_eq!(store.last_remote_snapshot_version().unwrap(), version(4));
        let persisted = store.get_target_data(&query("rooms").to_target()).unwrap().unwrap();
        assert_eq!(persisted.resume_token, b"resume-4".to_vec());
        assert_eq!(persisted.snapshot_version, version(4));
    }

    #[test]
    fn rejected_write_reveals_the_latest_server_document() {
        let store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(target.target_id, 2, vec![doc("rooms/a", 2, &[("v", int(2))])]))
            .unwrap();
        let write = store
            .write_locally(vec![Mutation::patch(key("rooms/a"), map(&[("mine", int(1))]))])
            .unwrap();
        store
            .apply_remote_event(&remote_event(target.target_id, 4, vec![doc("rooms/a", 4, &[("v", int(4))])]))
            .unwrap();

        let rejected = store.reject_batch(write.batch_id).unwrap();
        let document = &rejected[&key("rooms/a")];
        assert!(!document.has_local_mutations());
        assert_eq!(document.version(), version(4));
        assert_eq!(data(document), &map(&[("v", int(4))]));
    }

    #[test]
    fn deletes_at_min_version_remove_the_cache_entry() {
        let store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(target.target_id, 1, vec![doc("rooms/a", 1, &[])]))
            .unwrap();
        let mut event = remote_event(target.target_id, 2, Vec::new());
        event.document_updates.insert(
            key("rooms/a"),
            MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::min()),
        );
        let changed = store.apply_remote_event(&event).unwrap();
        assert!(changed.contains_key(&key("rooms/a")));
        assert!(!store.read_document(&key("rooms/a")).unwrap().is_valid_document());

        store
            .apply_remote_event(&remote_event(target.target_id, 3, vec![deleted_doc("rooms/b", 3)]))
            .unwrap();
        assert!(store.read_document(&key("rooms/b")).unwrap().is_no_document());
    }

    #[test]
    fn mismatched_targets_lose_their_resume_token() {
        let store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(target.target_id, 1, Vec::new()))
            .unwrap();
        let mut event = remote_event(target.target_id, 2, Vec::new());
        event
            .target_mismatches
            .insert(target.target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&event).unwrap();
        let target_data = store.get_target_data(&query("rooms").to_target()).unwrap().unwrap();
        assert!(target_data.resume_token.is_empty());
        assert!(target_data.snapshot_version.is_min());
    }

    #[test]
    fn released_targets_resume_with_the_same_id() {
        let store = store();
        let first = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(first.target_id, 1, vec![doc("rooms/a", 1, &[])]))
            .unwrap();
        store.release_target(first.target_id).unwrap();

        let again = store.allocate_target(query("rooms").to_target()).unwrap();
        assert_eq!(again.target_id, first.target_id);
        assert_eq!(again.resume_token, b"resume-1".to_vec());
        assert_eq!(
            store.remote_document_keys(again.target_id).unwrap(),
            [key("rooms/a")].into_iter().collect()
        );

        let result = store.execute_query(&query("rooms"), true).unwrap();
        assert_eq!(result.remote_keys.len(), 1);
        assert_eq!(result.documents.len(), 1);
    }

    #[test]
    fn acknowledged_delete_is_applied_to_the_remote_document() {
        let store = store();
        let write = store
            .write_locally(vec![Mutation::delete(key("rooms/a"))])
            .unwrap();
        assert!(write.changes[&key("rooms/a")].is_no_document());
        let acked = ack(&store, write.batch_id, 3);
        let document = &acked[&key("rooms/a")];
        assert!(document.is_no_document());
        assert!(document.has_committed_mutations());
        assert_eq!(document.version(), version(3));
    }
}
