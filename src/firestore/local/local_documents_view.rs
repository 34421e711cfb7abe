use std::collections::BTreeMap;
use std::sync::Arc;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{
    DocumentOverlayCache, MutationQueue, Persistence, PersistenceTransaction, RemoteDocumentCache,
};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, MutableDocument, Mutation,
};

/// Local view of documents: remote documents with the overlays of pending
/// writes applied.
pub struct LocalDocumentsView {
    remote_documents: Arc<dyn RemoteDocumentCache>,
    mutation_queue: Arc<dyn MutationQueue>,
    overlays: Arc<dyn DocumentOverlayCache>,
}

impl LocalDocumentsView {
    pub fn new(persistence: &dyn Persistence) -> Self {
        Self {
            remote_documents: persistence.remote_document_cache(),
            mutation_queue: persistence.mutation_queue(),
            overlays: persistence.document_overlay_cache(),
        }
    }

    pub fn get_document(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument> {
        let mut document = self.remote_documents.get_entry(txn, key)?;
        if let Some(overlay) = self.overlays.get_overlay(txn, key)? {
            overlay.apply(&mut document);
        }
        Ok(document)
    }

    /// Overlaid documents for `keys`. Keys unknown to the cache map to invalid
    /// documents.
    pub fn get_documents(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        self.apply_overlays(txn, documents)
    }

    fn apply_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        mut documents: DocumentMap,
    ) -> FirestoreResult<DocumentMap> {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        for (key, overlay) in self.overlays.get_overlays(txn, &keys)? {
            if let Some(document) = documents.get_mut(&key) {
                overlay.apply(document);
            }
        }
        Ok(documents)
    }

    /// Every document that matches `query` once pending writes are applied,
    /// including documents that so far exist only locally.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            let mut result = DocumentMap::new();
            if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
                let document = self.get_document(txn, &key)?;
                if document.is_found_document() {
                    result.insert(key, document);
                }
            }
            return Ok(result);
        }

        let mut documents = self.remote_documents.get_documents_matching_query(txn, query)?;
        let locally_written: DocumentKeySet = self
            .mutation_queue
            .all_mutation_batches_affecting_query(txn, query)?
            .iter()
            .flat_map(|batch| batch.keys())
            .filter(|key| !documents.contains_key(key))
            .collect();
        if !locally_written.is_empty() {
            documents.extend(self.remote_documents.get_entries(txn, &locally_written)?);
        }

        let mut documents = self.apply_overlays(txn, documents)?;
        documents.retain(|_, document| query.matches(document));
        Ok(documents)
    }

    /// Recomputes the overlay of every key in `keys` by replaying the pending
    /// batches that touch it, in batch order, over the remote document.
    /// Keys no pending batch changes lose their overlay.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut documents = self.remote_documents.get_entries(txn, keys)?;
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(txn, keys)?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut largest_batch: BTreeMap<DocumentKey, BatchId> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::default()));
                masks.insert(key.clone(), batch.apply_to_local_view(document, mask));
                largest_batch.insert(key, batch.batch_id());
            }
        }

        let mut overlays_by_batch: BTreeMap<BatchId, BTreeMap<DocumentKey, Mutation>> =
            BTreeMap::new();
        for key in keys {
            let overlay = match (largest_batch.get(key), masks.get(key), documents.get(key)) {
                (Some(batch_id), Some(mask), Some(document)) => {
                    Mutation::calculate_overlay_mutation(document, mask.as_ref())
                        .map(|mutation| (*batch_id, mutation))
                }
                _ => None,
            };
            match overlay {
                Some((batch_id, mutation)) => {
                    overlays_by_batch
                        .entry(batch_id)
                        .or_default()
                        .insert(key.clone(), mutation);
                }
                None => self.overlays.remove_overlay(txn, key)?,
            }
        }

        for (batch_id, overlays) in overlays_by_batch {
            self.overlays.save_overlays(txn, batch_id, overlays)?;
        }
        Ok(())
    }
}
