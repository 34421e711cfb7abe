use std::sync::Arc;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKeySet, DocumentMap};

/// Runs queries against the local cache.
///
/// There are no secondary indexes: every execution scans the remote
/// documents of the queried collection and merges in documents that only
/// exist locally. Ordering, bounds and limits are left to the view.
pub struct QueryEngine {
    local_documents: Arc<LocalDocumentsView>,
}

impl QueryEngine {
    pub fn new(local_documents: Arc<LocalDocumentsView>) -> Self {
        Self { local_documents }
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        let documents = self.local_documents.get_documents_matching_query(txn, query)?;
        log::debug!(
            "query {} matched {} documents locally ({} remote keys)",
            query.canonical_id(),
            documents.len(),
            remote_keys.len()
        );
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::model::{Mutation, Timestamp};
    use crate::firestore::test_support::{doc, key, map, query, version};
    use crate::firestore::value::FirestoreValue;

    #[test]
    fn scans_collection_and_local_writes() {
        let persistence = MemoryPersistence::new();
        let view = Arc::new(LocalDocumentsView::new(&persistence));
        let engine = QueryEngine::new(view.clone());
        let documents = persistence.remote_document_cache();
        let queue = persistence.mutation_queue();
        persistence
            .run_transaction("seed", &mut |txn| {
                documents.add_entry(txn, doc("rooms/a", 1, &[]), version(1))?;
                documents.add_entry(txn, doc("users/a", 1, &[]), version(1))?;
                let batch = queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    vec![Mutation::set(key("rooms/b"), map(&[("n", FirestoreValue::from(1_i64))]))],
                )?;
                view.recalculate_and_save_overlays(txn, &batch.keys())
            })
            .unwrap();

        persistence
            .run_transaction("query", &mut |txn| {
                let result =
                    engine.get_documents_matching_query(txn, &query("rooms"), &DocumentKeySet::new())?;
                assert_eq!(
                    result.keys().cloned().collect::<Vec<_>>(),
                    vec![key("rooms/a"), key("rooms/b")]
                );
                assert!(result[&key("rooms/b")].has_local_mutations());
                Ok(())
            })
            .unwrap();
    }
}
