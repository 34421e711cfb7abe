use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::firestore::error::{aborted, internal_error, FirestoreResult};
use crate::firestore::local::memory_persistence::{MemoryPersistence, PersistedState};
use crate::firestore::local::persistence::{
    DocumentOverlayCache, MutationQueue, Persistence, RemoteDocumentCache, TargetCache,
    TransactionBody,
};

/// Durable persistence that keeps the stores in memory and writes a JSON
/// snapshot of them to disk after every committed transaction.
///
/// The snapshot is written to a sibling temp file and renamed into place, so
/// a crash leaves either the previous or the new snapshot. A transaction
/// whose snapshot cannot be written is rolled back and fails with `aborted`.
pub struct FilePersistence {
    path: PathBuf,
    inner: MemoryPersistence,
}

impl FilePersistence {
    pub fn open(path: impl Into<PathBuf>) -> FirestoreResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            Self::load_record(&path)?
        } else {
            PersistedState::default()
        };
        Ok(Self {
            path,
            inner: MemoryPersistence::from_state(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_record(path: &Path) -> FirestoreResult<PersistedState> {
        let data = fs::read(path)
            .map_err(|err| internal_error(format!("failed to read persistence file: {err}")))?;
        serde_json::from_slice(&data).map_err(|err| {
            internal_error(format!("failed to parse persistence file as JSON: {err}"))
        })
    }

    fn persist(&self, record: &PersistedState) -> FirestoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                aborted(format!("failed to create persistence directory: {err}"))
            })?;
        }
        let serialized = serde_json::to_vec(record)
            .map_err(|err| internal_error(format!("failed to serialize persistence record: {err}")))?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, serialized)
            .map_err(|err| aborted(format!("failed to write persistence file: {err}")))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|err| aborted(format!("failed to replace persistence file: {err}")))?;
        Ok(())
    }
}

impl Persistence for FilePersistence {
    fn mutation_queue(&self) -> Arc<dyn MutationQueue> {
        self.inner.mutation_queue()
    }

    fn document_overlay_cache(&self) -> Arc<dyn DocumentOverlayCache> {
        self.inner.document_overlay_cache()
    }

    fn remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache> {
        self.inner.remote_document_cache()
    }

    fn target_cache(&self) -> Arc<dyn TargetCache> {
        self.inner.target_cache()
    }

    fn run_transaction(&self, action: &str, body: &mut TransactionBody<'_>) -> FirestoreResult<()> {
        self.inner
            .run_transaction_with(action, body, |stores| self.persist(&stores.export_state()))
    }

    fn shutdown(&self) {
        if let Err(err) = self.persist(&self.inner.export_state()) {
            log::warn!("failed to flush persistence on shutdown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::target_data::{TargetData, TargetPurpose};
    use crate::firestore::model::{Mutation, Timestamp};
    use crate::firestore::test_support::{doc, key, map, query, version};
    use crate::firestore::value::FirestoreValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "firestore-sync-persistence-{}-{}.json",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ))
    }

    #[test]
    fn committed_state_survives_reopen() {
        let path = temp_path();
        {
            let persistence = FilePersistence::open(path.clone()).unwrap();
            let queue = persistence.mutation_queue();
            let documents = persistence.remote_document_cache();
            let targets = persistence.target_cache();
            persistence
                .run_transaction("seed", &mut |txn| {
                    queue.add_mutation_batch(
                        txn,
                        Timestamp::now(),
                        vec![Mutation::set(
                            key("rooms/a"),
                            map(&[("n", FirestoreValue::from(1_i64))]),
                        )],
                    )?;
                    queue.set_last_stream_token(txn, b"token".to_vec())?;
                    documents.add_entry(txn, doc("rooms/b", 2, &[]), version(2))?;
                    let target_id = targets.allocate_target_id(txn)?;
                    targets.add_target_data(
                        txn,
                        TargetData::new(query("rooms").to_target(), target_id, TargetPurpose::Listen, 1),
                    )?;
                    targets.add_matching_keys(txn, &[key("rooms/b")].into_iter().collect(), target_id)?;
                    targets.set_last_remote_snapshot_version(txn, version(2))
                })
                .unwrap();
        }

        let reopened = FilePersistence::open(path.clone()).unwrap();
        let queue = reopened.mutation_queue();
        let documents = reopened.remote_document_cache();
        let targets = reopened.target_cache();
        reopened
            .run_transaction("verify", &mut |txn| {
                assert_eq!(queue.all_mutation_batches(txn)?.len(), 1);
                assert_eq!(queue.last_stream_token(txn)?, b"token".to_vec());
                assert!(documents.get_entry(txn, &key("rooms/b"))?.is_found_document());
                let target = targets
                    .get_target_data(txn, &query("rooms").to_target())?
                    .expect("target survives");
                assert!(targets
                    .matching_keys_for_target_id(txn, target.target_id)?
                    .contains(&key("rooms/b")));
                assert_eq!(targets.last_remote_snapshot_version(txn)?, version(2));
                assert_eq!(targets.allocate_target_id(txn)?, target.target_id + 2);
                let next = queue.add_mutation_batch(txn, Timestamp::now(), Vec::new())?;
                assert_eq!(next.batch_id(), 2);
                Ok(())
            })
            .unwrap();
        let _ = fs::remove_file(path);
    }

    #[test]
    fn unwritable_snapshot_aborts_and_rolls_back() {
        let directory = temp_path();
        fs::create_dir_all(&directory).unwrap();
        // The target path is a directory, so the rename always fails.
        let persistence = FilePersistence {
            path: directory.clone(),
            inner: MemoryPersistence::new(),
        };
        let documents = persistence.remote_document_cache();
        let err = persistence
            .run_transaction("write", &mut |txn| {
                documents.add_entry(txn, doc("rooms/a", 1, &[]), version(1))
            })
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/aborted");

        persistence
            .inner
            .run_transaction("read", &mut |txn| {
                assert!(!documents.get_entry(txn, &key("rooms/a"))?.is_valid_document());
                Ok(())
            })
            .unwrap();
        let _ = fs::remove_file(directory.with_extension("tmp"));
        let _ = fs::remove_dir_all(directory);
    }
}
