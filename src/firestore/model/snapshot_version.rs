use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Logical point in the server's history at which a document or target was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({}.{:09})", self.timestamp.seconds, self.timestamp.nanos)
    }
}
