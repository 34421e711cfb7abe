//! Storage boundary of the local store.
//!
//! A [`Persistence`] exposes four logical stores as trait objects. Every store
//! method runs inside a [`PersistenceTransaction`] handed out by
//! [`Persistence::run_transaction`]; a transaction whose body fails is rolled
//! back through its undo journal so no partial write survives.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::firestore::core::{Query, Target, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, Mutation, MutationBatch,
    Overlay, ResourcePath, SnapshotVersion, Timestamp,
};

pub type UndoAction = Box<dyn FnOnce() + Send>;

pub struct PersistenceTransaction {
    action: String,
    undo: Vec<UndoAction>,
    journaled_stores: HashSet<&'static str>,
}

impl PersistenceTransaction {
    pub(crate) fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            undo: Vec::new(),
            journaled_stores: HashSet::new(),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn record_undo(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.undo.push(Box::new(undo));
    }

    /// Records an undo action only for the first write to `store` in this
    /// transaction. `make_undo` typically captures a copy of the store state.
    pub fn record_undo_once<F>(&mut self, store: &'static str, make_undo: F)
    where
        F: FnOnce() -> UndoAction,
    {
        if self.journaled_stores.insert(store) {
            self.undo.push(make_undo());
        }
    }

    pub(crate) fn rollback(self) {
        log::debug!("rolling back transaction '{}'", self.action);
        for undo in self.undo.into_iter().rev() {
            undo();
        }
    }

    pub(crate) fn commit(self) {}
}

pub trait MutationQueue: Send + Sync {
    fn is_empty(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<bool>;

    fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>>;

    /// First batch with an id greater than `batch_id`.
    fn next_mutation_batch_after_batch_id(
        &self,
        txn: &mut PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>>;

    fn highest_unacknowledged_batch_id(
        &self,
        txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<BatchId>;

    fn all_mutation_batches(
        &self,
        txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    fn all_mutation_batches_affecting_document_key(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    fn all_mutation_batches_affecting_document_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    fn all_mutation_batches_affecting_query(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    /// Removes the oldest batch. Removing any other batch fails with
    /// `failed-precondition`.
    fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()>;

    fn last_stream_token(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<Vec<u8>>;

    fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction,
        token: Vec<u8>,
    ) -> FirestoreResult<()>;
}

pub trait DocumentOverlayCache: Send + Sync {
    fn get_overlay(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>>;

    fn get_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>;

    /// Stores one overlay per key, all tagged with `largest_batch_id`.
    fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()>;

    fn remove_overlay(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    /// Removes the overlays of `keys` that were tagged with `batch_id`.
    fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        batch_id: BatchId,
    ) -> FirestoreResult<()>;

    /// Overlays of documents directly under `collection` whose largest batch
    /// id is greater than `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        txn: &mut PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>;
}

pub trait RemoteDocumentCache: Send + Sync {
    fn add_entry(
        &self,
        txn: &mut PersistenceTransaction,
        document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()>;

    fn remove_entry(&self, txn: &mut PersistenceTransaction, key: &DocumentKey)
        -> FirestoreResult<()>;

    /// The cached document, or an invalid document when nothing is cached.
    fn get_entry(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument>;

    fn get_entries(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap>;

    /// Found documents under the query's path that match it.
    fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<DocumentMap>;
}

pub trait TargetCache: Send + Sync {
    fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: TargetData,
    ) -> FirestoreResult<()>;

    fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: TargetData,
    ) -> FirestoreResult<()>;

    /// Removes the target and its matching keys.
    fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn get_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>>;

    fn allocate_target_id(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<TargetId>;

    fn highest_target_id(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<TargetId>;

    fn next_sequence_number(
        &self,
        txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<ListenSequenceNumber>;

    fn last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction,
    ) -> FirestoreResult<SnapshotVersion>;

    fn set_last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction,
        version: SnapshotVersion,
    ) -> FirestoreResult<()>;

    fn add_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn remove_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<DocumentKeySet>;

    /// Whether any target references `key`.
    fn contains_key(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<bool>;
}

/// Body of a transaction. Returning an error rolls the transaction back.
pub type TransactionBody<'a> = dyn FnMut(&mut PersistenceTransaction) -> FirestoreResult<()> + 'a;

pub trait Persistence: Send + Sync {
    fn mutation_queue(&self) -> Arc<dyn MutationQueue>;

    fn document_overlay_cache(&self) -> Arc<dyn DocumentOverlayCache>;

    fn remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache>;

    fn target_cache(&self) -> Arc<dyn TargetCache>;

    /// Runs `body` atomically. `action` names the transaction in logs.
    fn run_transaction(&self, action: &str, body: &mut TransactionBody<'_>) -> FirestoreResult<()>;

    fn shutdown(&self) {}
}
