use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Placeholder for a key the cache knows nothing about.
    Invalid,
    FoundDocument,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// A write committed but the resulting contents are unknown.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as held by the caches. The type and state change in place as
/// remote updates and local mutations are applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

pub type Document = MutableDocument;
pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type DocumentKeySet = BTreeSet<DocumentKey>;

impl MutableDocument {
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_found_document(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_unknown_document(version);
        document
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    /// Absent according to the backend. A local delete only tombstones the
    /// document until it is acknowledged.
    pub fn is_confirmed_absent(&self) -> bool {
        self.is_no_document() && !self.has_local_mutations()
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }
}
