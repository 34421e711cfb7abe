//! Offline-first document synchronization.
//!
//! [`firestore::FirestoreClient`] keeps a local cache of documents and
//! pending writes, serves queries from it, and keeps it in sync with a
//! backend over two long-lived streams: one that watches query results and
//! one that commits writes.

pub mod firestore;
pub mod platform;
pub mod util;
