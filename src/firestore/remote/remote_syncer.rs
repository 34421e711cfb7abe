use crate::firestore::core::{OnlineState, TargetId};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKeySet, MutationBatchResult};
use crate::firestore::remote::remote_event::RemoteEvent;

/// Receives what the remote store learns from the backend. Implemented by the
/// sync engine; every callback runs on the client's queue.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot of watch changes.
    fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to listen to `target_id`.
    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    /// The head batch of the write pipeline was committed.
    fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend rejected `batch_id` with a permanent error.
    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_online_state_change(&self, online_state: OnlineState);

    /// Keys the client currently believes match `target_id`, including
    /// documents of limbo resolution targets.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;
}
