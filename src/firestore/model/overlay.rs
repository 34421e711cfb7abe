use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, DocumentKey, MutableDocument, Mutation, Timestamp};

/// Net effect of all pending batches on one document, tagged with the largest
/// batch id that contributed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    largest_batch_id: BatchId,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }

    pub fn largest_batch_id(&self) -> BatchId {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    /// Applies the overlay on top of the remote document.
    pub fn apply(&self, document: &mut MutableDocument) {
        self.mutation
            .apply_to_local_view(document, None, Timestamp::now());
    }
}
