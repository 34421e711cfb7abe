use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, FieldMask, MutableDocument, Mutation, MutationResult,
    SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Batch id that precedes every real batch.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations created by one local write call. Applied atomically and owned by
/// the mutation queue until acknowledged or rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn touches(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies this batch's mutations for `document` in order, threading the
    /// accumulated field mask through.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            let mutation_result = result.mutation_results.get(index).ok_or_else(|| {
                internal_error(format!(
                    "Missing write result {index} for batch {}",
                    self.batch_id
                ))
            })?;
            mutation.apply_to_remote_document(document, mutation_result);
        }
        Ok(())
    }
}

/// A batch together with the backend's response to it.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document had after the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Batch {} has {} mutations but the server returned {} results",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
