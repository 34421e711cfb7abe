pub mod file_persistence;
pub mod local_documents_view;
pub mod local_store;
pub mod memory_persistence;
pub mod persistence;
pub mod query_engine;
pub mod target_data;

#[doc(inline)]
pub use file_persistence::FilePersistence;
#[doc(inline)]
pub use local_documents_view::LocalDocumentsView;
#[doc(inline)]
pub use local_store::{LocalStore, LocalWriteResult, QueryResult};
#[doc(inline)]
pub use memory_persistence::MemoryPersistence;
#[doc(inline)]
pub use persistence::{
    DocumentOverlayCache, MutationQueue, Persistence, PersistenceTransaction, RemoteDocumentCache,
    TargetCache,
};
#[doc(inline)]
pub use query_engine::QueryEngine;
#[doc(inline)]
pub use target_data::{ListenSequenceNumber, TargetData, TargetPurpose};
