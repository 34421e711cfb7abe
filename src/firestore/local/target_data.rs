use serde::{Deserialize, Serialize};

use crate::firestore::core::{Target, TargetId};
use crate::firestore::model::SnapshotVersion;

pub type ListenSequenceNumber = i64;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch without a usable bloom
    /// filter.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter could not reconcile the mismatch.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for the target.
    pub snapshot_version: SnapshotVersion,
    /// Last version at which the target's view had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents the client believed matched when it last resumed.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// New resume token and snapshot version. The expected count no longer
    /// applies once the token changes.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}
