use std::collections::BTreeMap;
use std::fmt;

use crate::firestore::core::Query;
use crate::firestore::model::{Document, DocumentKey, DocumentKeySet, DocumentSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Position of the change type when a snapshot's changes are sorted.
    pub(crate) fn sort_order(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: Document) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Accumulates per-key changes, folding successive changes to one key into
/// the single change a listener should observe.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Added, Removed) => None,
            (Added, Metadata) | (Added, Modified) => {
                Some(DocumentViewChange::new(Added, change.document))
            }
            (Modified, Removed) | (Metadata, Removed) => {
                Some(DocumentViewChange::new(Removed, old.document.clone()))
            }
            (Modified, Metadata) | (Modified, Modified) | (Metadata, Modified) => {
                Some(DocumentViewChange::new(Modified, change.document))
            }
            (Metadata, Metadata) => Some(DocumentViewChange::new(Metadata, change.document)),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => {
                log::warn!(
                    "unexpected change sequence {old_type:?} then {new_type:?} for {key}"
                );
                Some(change)
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes in key order.
    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Immutable result of a query at a point in time, with the changes since
/// the previous snapshot delivered for the same query.
#[derive(Clone)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents with writes the backend has not yet acknowledged.
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that presents every document in `documents` as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        Self {
            query,
            old_documents: documents.empty_like(),
            documents,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Keys of the documents in the snapshot, in query order.
    pub fn document_keys(&self) -> Vec<DocumentKey> {
        self.documents.keys().cloned().collect()
    }
}

impl fmt::Debug for ViewSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSnapshot")
            .field("query", &self.query.canonical_id())
            .field("documents", &self.documents)
            .field("doc_changes", &self.doc_changes.len())
            .field("mutated_keys", &self.mutated_keys)
            .field("from_cache", &self.from_cache)
            .field("sync_state_changed", &self.sync_state_changed)
            .field("excludes_metadata_changes", &self.excludes_metadata_changes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::test_support::doc;

    #[test]
    fn add_then_remove_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(DocumentViewChange::new(ChangeType::Added, doc("rooms/a", 1, &[])));
        set.track(DocumentViewChange::new(ChangeType::Removed, doc("rooms/a", 1, &[])));
        assert!(set.is_empty());
    }

    #[test]
    fn folds_successive_changes() {
        let mut set = DocumentChangeSet::new();
        set.track(DocumentViewChange::new(ChangeType::Removed, doc("rooms/a", 1, &[])));
        set.track(DocumentViewChange::new(ChangeType::Added, doc("rooms/a", 2, &[])));
        set.track(DocumentViewChange::new(ChangeType::Metadata, doc("rooms/b", 1, &[])));
        set.track(DocumentViewChange::new(ChangeType::Modified, doc("rooms/b", 2, &[])));

        let changes = set.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert_eq!(changes[0].document.version(), doc("rooms/a", 2, &[]).version());
        assert_eq!(changes[1].change_type, ChangeType::Modified);
    }
}
