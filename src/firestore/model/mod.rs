mod database_id;
mod document;
mod document_key;
mod document_set;
mod field_path;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::DatabaseId;
pub use document::{
    Document, DocumentKeySet, DocumentMap, DocumentState, DocumentType, MutableDocument,
};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_path::{FieldPath, IntoFieldPath};
pub use mutation::{
    FieldMask, FieldTransform, Mutation, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{BatchId, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
