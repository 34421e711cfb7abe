use std::cmp::Ordering;

use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot,
};
use crate::firestore::core::{LimitType, OnlineState, Query};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet,
};
use crate::firestore::remote::TargetChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

/// Result of [`View::compute_doc_changes`], to be passed to
/// [`View::apply_changes`].
#[derive(Clone)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit removed documents that could be replaced by documents not
    /// in `document_set`. The query must be re-run before applying.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Incrementally maintained result of one query.
///
/// The view keeps the documents that currently match, which of them the
/// backend reported for the target (`synced_documents`), and which are in
/// limbo: present locally but not confirmed by a current target.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    document_set: DocumentSet,
    mutated_keys: DocumentKeySet,
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    current: bool,
    sync_state: Option<SyncState>,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            mutated_keys: DocumentKeySet::new(),
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            current: false,
            sync_state: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }

    /// Computes how `doc_changes` alter the view without applying them.
    /// `previous` continues a computation whose `needs_refill` was set.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(
                                ChangeType::Modified,
                                new_doc.clone(),
                            ));
                            change_applied = true;

                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.compare(new_doc, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.compare(new_doc, first) == Ordering::Less);
                            if past_last || before_first {
                                // The modified document may now sort outside
                                // the limit, letting another one in.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(
                        ChangeType::Removed,
                        old_doc.clone(),
                    ));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.add(new_doc.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Applies computed changes and an optional target change. Returns a
    /// snapshot when the result differs from the last one raised.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_order()
                .cmp(&right.change_type.sort_order())
                .then_with(|| self.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                old_documents,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results: target_change
                    .is_some_and(|change| !change.resume_token.is_empty()),
            }),
            limbo_changes,
        }
    }

    /// Going offline makes the view stale: it stays on screen but is marked as
    /// coming from cache until the target is current again.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None);
        }
        ViewChange::default()
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not synced for {}", self.query.canonical_id());
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes explain why the backend does not know the document.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

/// A document whose local write was just acknowledged keeps its optimistic
/// state until the backend sends the synced version.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::OrderDirection;
    use crate::firestore::test_support::{deleted_doc, doc, key, query};
    use crate::firestore::value::FirestoreValue;

    fn changes(documents: &[Document]) -> DocumentMap {
        documents
            .iter()
            .map(|document| (document.key().clone(), document.clone()))
            .collect()
    }

    fn current_change(added: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            added_documents: added.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn apply(view: &mut View, documents: &[Document], target_change: Option<&TargetChange>) -> ViewChange {
        let computed = view.compute_doc_changes(&changes(documents), None);
        view.apply_changes(computed, true, target_change)
    }

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from(value)
    }

    #[test]
    fn single_insert_yields_single_added_change_and_is_idempotent() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let first = apply(&mut view, &[doc("rooms/a", 1, &[])], Some(&current_change(&["rooms/a"])));
        let snapshot = first.snapshot.expect("snapshot");
        assert_eq!(snapshot.doc_changes.len(), 1);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Added);
        assert!(!snapshot.from_cache);

        let inserted = doc("rooms/b", 2, &[]);
        let second = apply(&mut view, &[inserted.clone()], Some(&current_change(&["rooms/b"])));
        let snapshot = second.snapshot.expect("snapshot");
        assert_eq!(
            snapshot.doc_changes,
            vec![DocumentViewChange::new(ChangeType::Added, inserted.clone())]
        );

        let repeated = apply(&mut view, &[inserted], Some(&current_change(&["rooms/b"])));
        assert!(repeated.snapshot.is_none());
        assert!(repeated.limbo_changes.is_empty());
    }

    #[test]
    fn limit_promotion_is_one_diff() {
        let ordered = query("rooms")
            .order_by("rank", OrderDirection::Ascending)
            .unwrap()
            .limit_to_first(1)
            .unwrap();
        let mut view = View::new(ordered.clone(), DocumentKeySet::new());
        let top = doc("rooms/a", 1, &[("rank", int(1))]);
        let second = doc("rooms/b", 1, &[("rank", int(2))]);
        let initial = apply(&mut view, &[top.clone(), second.clone()], None);
        assert_eq!(initial.snapshot.unwrap().document_keys(), vec![key("rooms/a")]);

        let deleted = deleted_doc("rooms/a", 2);
        let computed = view.compute_doc_changes(&changes(&[deleted]), None);
        assert!(computed.needs_refill);

        // Refill against the full local result, as the sync engine does.
        let refilled = view.compute_doc_changes(&changes(&[second.clone()]), Some(computed));
        let snapshot = view.apply_changes(refilled, true, None).snapshot.expect("snapshot");
        assert_eq!(
            snapshot.doc_changes,
            vec![
                DocumentViewChange::new(ChangeType::Removed, top),
                DocumentViewChange::new(ChangeType::Added, second),
            ]
        );
        assert_eq!(snapshot.document_keys(), vec![key("rooms/b")]);
    }

    #[test]
    fn metadata_only_changes_are_reported_as_metadata() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let mut local = doc("rooms/a", 0, &[("n", int(1))]);
        local.set_has_local_mutations();
        let first = apply(&mut view, &[local], None).snapshot.unwrap();
        assert!(first.has_pending_writes());

        let synced = doc("rooms/a", 3, &[("n", int(1))]);
        let snapshot = apply(&mut view, &[synced], Some(&current_change(&["rooms/a"])))
            .snapshot
            .unwrap();
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn acknowledged_write_waits_for_synced_version() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let mut local = doc("rooms/a", 0, &[("n", int(2))]);
        local.set_has_local_mutations();
        apply(&mut view, &[local], None);

        let mut committed = doc("rooms/a", 3, &[("n", int(1))]);
        committed.set_has_committed_mutations();
        let held = view.compute_doc_changes(&changes(&[committed]), None);
        assert!(held.change_set.is_empty());
    }

    #[test]
    fn unsynced_documents_enter_limbo_once_current() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let change = apply(
            &mut view,
            &[doc("rooms/a", 1, &[]), doc("rooms/b", 1, &[])],
            Some(&current_change(&["rooms/a"])),
        );
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Added(key("rooms/b"))]
        );
        assert!(change.snapshot.unwrap().from_cache);

        let resolved = apply(
            &mut view,
            &[deleted_doc("rooms/b", 2)],
            Some(&current_change(&[])),
        );
        assert_eq!(
            resolved.limbo_changes,
            vec![LimboDocumentChange::Removed(key("rooms/b"))]
        );
        assert!(!resolved.snapshot.unwrap().from_cache);
    }

    #[test]
    fn going_offline_marks_view_from_cache() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        apply(&mut view, &[doc("rooms/a", 1, &[])], Some(&current_change(&["rooms/a"])));
        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.expect("snapshot");
        assert!(snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
