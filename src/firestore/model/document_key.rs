use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Path of a single document. Keys order lexicographically by segment, which is
/// also the final tiebreak of every query ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid document path ({path}). Document keys need an even number of segments"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// Parses a full resource name such as
    /// `projects/p/databases/d/documents/reports/1`.
    pub fn from_resource_name(name: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(name)?;
        let valid = path.len() >= 4
            && path.get(0) == Some("projects")
            && path.get(2) == Some("databases");
        if !valid || path.get(4) != Some("documents") {
            return Err(invalid_argument(format!(
                "Tried to deserialize invalid document name: {name}"
            )));
        }
        Self::from_path(path.pop_first(5))
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.path.len() >= 2 && self.path.get(self.path.len() - 2) == Some(collection_id)
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}
