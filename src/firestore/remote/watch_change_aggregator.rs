use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::TargetId;
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local cache currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// The target data of an active listen, `None` once it was unlistened.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, PartialEq, Eq)]
enum BloomFilterOutcome {
    Applied,
    Skipped,
    FalsePositive,
}

/// Changes accumulated for one target since the last remote event.
#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests. Changes for a target with pending
    /// responses belong to a listen the client already abandoned.
    pending_responses: u32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
    /// Set after an unreconciled existence filter. Holds the keys the
    /// re-listen has sent so far; everything else is swept once the target
    /// is current again.
    resync: Option<DocumentKeySet>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
            resync: None,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..Default::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                DocumentChangeType::Added => change.added_documents.insert(key.clone()),
                DocumentChangeType::Modified => change.modified_documents.insert(key.clone()),
                DocumentChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: DocumentChangeType) {
        self.has_pending_changes = true;
        if change_type != DocumentChangeType::Removed {
            if let Some(resent) = self.resync.as_mut() {
                resent.insert(key.clone());
            }
        }
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds the listen stream's individual changes into [`RemoteEvent`]s.
pub struct WatchChangeAggregator<P>
where
    P: TargetMetadataProvider,
{
    metadata: Arc<P>,
    serializer: JsonProtoSerializer,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl<P> WatchChangeAggregator<P>
where
    P: TargetMetadataProvider,
{
    pub fn new(metadata: Arc<P>, serializer: JsonProtoSerializer) -> Self {
        Self {
            metadata,
            serializer,
            target_states: BTreeMap::new(),
            pending_document_updates: DocumentMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentChange) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone());
                }
                document => {
                    self.remove_document_from_target(*target_id, &change.key, document.clone());
                }
            }
        }

        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.document.clone());
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.targets_of(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    // The first response after a re-listen; anything queued
                    // before it belonged to the previous listen.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    if change.cause.is_some() {
                        log::warn!("target {target_id} removed with a cause; the listen is rejected");
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        self.sweep_unsent_documents(target_id);
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        // Documents the backend resends before the next
                        // snapshot are added back in the same event.
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Reconciles the backend's document count for a target with the local
    /// one. Keys are only removed when a bloom filter proves they are gone;
    /// every other disagreement schedules a full re-listen.
    pub fn handle_existence_filter(&mut self, filter: &ExistenceFilterChange) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        let target = &target_data.target;
        if target.is_document_target() {
            if expected_count == 0 {
                // The single document of the target does not exist.
                let Ok(key) = DocumentKey::from_path(target.path().clone()) else {
                    log::warn!("document target {target_id} has an invalid path");
                    return;
                };
                let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(target_id, &key, Some(deleted));
            } else if expected_count != 1 {
                log::warn!(
                    "single document existence filter for target {target_id} has count {expected_count}"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id);
        if current_count == i64::from(expected_count) {
            return;
        }

        let outcome = self.apply_bloom_filter(filter, current_count);
        if outcome != BloomFilterOutcome::Applied {
            let purpose = if outcome == BloomFilterOutcome::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}"
            );
            self.target_states.insert(
                target_id,
                TargetState {
                    resync: Some(DocumentKeySet::new()),
                    ..Default::default()
                },
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    /// Builds the event for everything accumulated so far and clears the
    /// accumulated document updates.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };

            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current document target without its document means the
                // document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key)
                    {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id)
                    .map(|data| data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Called for every `addTarget`/`removeTarget` sent, so responses of an
    /// abandoned listen can be told apart.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn targets_of(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id))
            .collect()
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterOutcome {
        let Some(params) = &filter.unchanged_names else {
            return BloomFilterOutcome::Skipped;
        };
        let bloom_filter = match BloomFilter::from_params(params) {
            Ok(bloom_filter) => bloom_filter,
            Err(err) => {
                log::debug!("ignoring invalid bloom filter: {err}");
                return BloomFilterOutcome::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterOutcome::Skipped;
        }

        let removed = self.filter_removed_documents(&bloom_filter, filter.target_id);
        if i64::from(filter.count) != current_count - removed {
            BloomFilterOutcome::FalsePositive
        } else {
            BloomFilterOutcome::Applied
        }
    }

    /// Removes every key the bloom filter does not contain. Returns how many
    /// were removed.
    fn filter_removed_documents(&mut self, bloom_filter: &BloomFilter, target_id: TargetId) -> i64 {
        let mut removed = 0;
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            let name = self.serializer.document_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// After a re-listen triggered by an existence filter, drops the keys the
    /// backend did not send again.
    fn sweep_unsent_documents(&mut self, target_id: TargetId) {
        let Some(resent) = self
            .target_states
            .get_mut(&target_id)
            .and_then(|state| state.resync.take())
        else {
            return;
        };
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            if !resent.contains(&key) {
                self.remove_document_from_target(target_id, &key, None);
            }
        }
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        self.metadata.get_remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn reset_target(&mut self, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None);
        }
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: MutableDocument) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            DocumentChangeType::Modified
        } else {
            DocumentChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        let contains = self.target_contains_document(target_id, key);
        let state = self.ensure_target_state(target_id);
        if contains {
            state.add_document_change(key.clone(), DocumentChangeType::Removed);
        } else {
            // The target never reported the key; forget a pending add.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata
            .get_remote_keys_for_target(target_id)
            .contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        self.target_data_for_active_target(target_id).is_some()
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.get_target_data_for_target(target_id),
        }
    }
}
