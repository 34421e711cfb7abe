use std::collections::BTreeMap;

use crate::firestore::core::TargetId;
use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{DocumentKeySet, DocumentMap, SnapshotVersion};

/// Aggregated result of a consistent batch of watch changes, raised once the
/// backend marks a global snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose local state diverged from the backend. Their resume token
    /// is discarded and they are listened to again with the given purpose.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: DocumentMap,
    /// Keys that were only referenced by limbo resolution targets.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target part of a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Opaque token to resume the target from this snapshot. Empty when the
    /// backend sent none.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}
