use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::firestore::constants::MAX_PENDING_WRITES;
use crate::firestore::core::{OnlineState, TargetId};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{DocumentKeySet, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::StreamState;
use crate::firestore::remote::streams::{ListenStream, ListenStreamDelegate, WriteStream, WriteStreamDelegate};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::util::AsyncQueue;

/// Reasons the network is disabled. The network is used only while the set
/// is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    StorageFailure,
    CredentialChange,
    Shutdown,
}

type ListenTargets = Arc<Mutex<BTreeMap<TargetId, TargetData>>>;

#[derive(Default)]
struct SyncerSlot(OnceLock<Weak<dyn RemoteSyncer>>);

impl SyncerSlot {
    fn get(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.0.get().and_then(Weak::upgrade)
    }
}

/// Answers the aggregator's questions from the active listens and the sync
/// engine.
struct RemoteMetadata {
    listen_targets: ListenTargets,
    syncer: Arc<SyncerSlot>,
}

impl TargetMetadataProvider for RemoteMetadata {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer
            .get()
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.lock().unwrap().get(&target_id).cloned()
    }
}

/// Bridges the local store and the backend.
///
/// Owns the listen and write streams. Targets passed to
/// [`listen`](Self::listen) are (re)sent whenever the listen stream opens,
/// and pending mutation batches are streamed, at most
/// `MAX_PENDING_WRITES` at a time, whenever the network is usable. Everything
/// runs on the client's [`AsyncQueue`].
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    me: Weak<RemoteStoreInner>,
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    serializer: JsonProtoSerializer,
    syncer: Arc<SyncerSlot>,
    listen_targets: ListenTargets,
    metadata: Arc<RemoteMetadata>,
    watch_stream: ListenStream<RemoteListenDelegate>,
    write_stream: WriteStream<RemoteWriteDelegate>,
    online_state: OnlineStateTracker,
    state: Mutex<RemoteState>,
}

#[derive(Default)]
struct RemoteState {
    /// Present while the listen stream is started.
    aggregator: Option<WatchChangeAggregator<RemoteMetadata>>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        layer: &NetworkLayer,
        serializer: JsonProtoSerializer,
        online_state_timeout: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|me: &Weak<RemoteStoreInner>| {
            let syncer = Arc::new(SyncerSlot::default());
            let listen_targets: ListenTargets = Arc::new(Mutex::new(BTreeMap::new()));
            let metadata = Arc::new(RemoteMetadata {
                listen_targets: Arc::clone(&listen_targets),
                syncer: Arc::clone(&syncer),
            });
            let watch_stream = ListenStream::new(
                layer,
                serializer.clone(),
                Arc::new(RemoteListenDelegate { inner: me.clone() }),
            );
            let write_stream = WriteStream::new(
                layer,
                serializer.clone(),
                Arc::new(RemoteWriteDelegate { inner: me.clone() }),
            );
            let handler_syncer = Arc::clone(&syncer);
            let online_state = OnlineStateTracker::new(
                layer.queue().clone(),
                online_state_timeout,
                Arc::new(move |state| {
                    if let Some(syncer) = handler_syncer.get() {
                        syncer.apply_online_state_change(state);
                    }
                }),
            );
            RemoteStoreInner {
                me: me.clone(),
                queue: layer.queue().clone(),
                local_store,
                serializer,
                syncer,
                listen_targets,
                metadata,
                watch_stream,
                write_stream,
                online_state,
                state: Mutex::new(RemoteState::default()),
            }
        });
        Self { inner }
    }

    /// Registers the receiver of remote events. Only the first call has an
    /// effect.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        if self.inner.syncer.0.set(syncer).is_err() {
            log::warn!("RemoteStore syncer already set");
        }
    }

    /// Restores the last stream token and connects.
    pub fn start(&self) -> FirestoreResult<()> {
        let token = self.inner.local_store.last_stream_token()?;
        self.inner.write_stream.set_last_stream_token(token);
        self.inner.enable_network_internal()
    }

    pub fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.remove_offline_cause(OfflineCause::UserDisabled);
        self.inner.enable_network_internal()
    }

    /// Stops both streams and reports `Offline`. Pending batches stay in the
    /// mutation queue and are resent once the network is enabled.
    pub fn disable_network(&self) {
        self.inner.add_offline_cause(OfflineCause::UserDisabled);
        self.inner.disable_network_internal();
        self.inner.online_state.set(OnlineState::Offline);
    }

    pub fn shutdown(&self) {
        log::debug!("RemoteStore shutting down");
        self.inner.add_offline_cause(OfflineCause::Shutdown);
        self.inner.disable_network_internal();
        // Not broadcast: the client is going away.
        self.inner.listen_targets.lock().unwrap().clear();
    }

    /// Reconnects both streams so they pick up the new credentials.
    pub fn handle_credential_change(&self) -> FirestoreResult<()> {
        if !self.inner.can_use_network() {
            return Ok(());
        }
        log::debug!("RemoteStore restarting streams for new credential");
        self.inner.add_offline_cause(OfflineCause::CredentialChange);
        self.inner.disable_network_internal();
        self.inner.online_state.set(OnlineState::Unknown);
        self.inner.remove_offline_cause(OfflineCause::CredentialChange);
        self.inner.enable_network_internal()
    }

    /// Starts listening to `target_data`. A target already listened to is
    /// left alone.
    pub fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut targets = self.inner.listen_targets.lock().unwrap();
            if targets.contains_key(&target_id) {
                return Ok(());
            }
            targets.insert(target_id, target_data.clone());
        }

        if self.inner.should_start_watch_stream() {
            self.inner.start_watch_stream();
            Ok(())
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(target_data)
        } else {
            Ok(())
        }
    }

    pub fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        if self.inner.listen_targets.lock().unwrap().remove(&target_id).is_none() {
            log::debug!("unlisten of unknown target {target_id}");
            return Ok(());
        }
        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(target_id)?;
        }
        Ok(())
    }

    /// Pulls batches from the mutation queue into the write pipeline and
    /// starts the write stream when there is something to send.
    pub fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline()
    }

    pub fn can_use_network(&self) -> bool {
        self.inner.can_use_network()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state.state()
    }

    pub fn listen_stream_state(&self) -> StreamState {
        self.inner.watch_stream.state()
    }

    pub fn write_stream_state(&self) -> StreamState {
        self.inner.write_stream.state()
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.inner.state.lock().unwrap().write_pipeline.len()
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer.get()
    }

    fn add_offline_cause(&self, cause: OfflineCause) {
        self.state.lock().unwrap().offline_causes.insert(cause);
    }

    fn remove_offline_cause(&self, cause: OfflineCause) {
        self.state.lock().unwrap().offline_causes.remove(&cause);
    }

    fn can_use_network(&self) -> bool {
        self.state.lock().unwrap().offline_causes.is_empty()
    }

    fn enable_network_internal(&self) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline()
    }

    fn disable_network_internal(&self) {
        self.write_stream.stop();
        self.watch_stream.stop();

        let mut state = self.state.lock().unwrap();
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.aggregator = None;
    }

    /// Runs `action` against the aggregator without holding the state lock.
    /// `None` when the listen stream is not started.
    fn with_aggregator<R>(
        &self,
        action: impl FnOnce(&mut WatchChangeAggregator<RemoteMetadata>) -> R,
    ) -> Option<R> {
        let mut aggregator = self.state.lock().unwrap().aggregator.take()?;
        let result = action(&mut aggregator);
        let mut state = self.state.lock().unwrap();
        if state.aggregator.is_none() {
            state.aggregator = Some(aggregator);
        }
        Some(result)
    }

    // Listen stream

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network()
            && !self.watch_stream.is_started()
            && !self.listen_targets.lock().unwrap().is_empty()
    }

    fn start_watch_stream(&self) {
        self.state.lock().unwrap().aggregator = Some(WatchChangeAggregator::new(
            Arc::clone(&self.metadata),
            self.serializer.clone(),
        ));
        self.watch_stream.start();
        self.online_state.handle_watch_stream_start();
    }

    fn send_watch_request(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        self.with_aggregator(|aggregator| aggregator.record_pending_target_request(target_id));

        let resuming = !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min();
        let target_data = if resuming {
            let expected = self
                .syncer()
                .map(|syncer| syncer.get_remote_keys_for_target(target_id).len())
                .unwrap_or(0);
            target_data.with_expected_count(expected as i32)
        } else {
            target_data
        };
        self.watch_stream.watch(&target_data)
    }

    fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.with_aggregator(|aggregator| aggregator.record_pending_target_request(target_id));
        self.watch_stream.unwatch(target_id)
    }

    fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = self.listen_targets.lock().unwrap().values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data)?;
        }
        Ok(())
    }

    fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        self.online_state.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Removed && target_change.cause.is_some() {
                return self.handle_target_error(target_change);
            }
        }

        let applied = self.with_aggregator(|aggregator| match change {
            WatchChange::DocumentChange(change) => aggregator.handle_document_change(change),
            WatchChange::TargetChange(change) => aggregator.handle_target_change(&change),
            WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&filter),
        });
        if applied.is_none() || snapshot_version.is_min() {
            return Ok(());
        }

        let result = self
            .local_store
            .last_remote_snapshot_version()
            .and_then(|last_remote| {
                if snapshot_version >= last_remote {
                    self.raise_watch_snapshot(snapshot_version)
                } else {
                    Ok(())
                }
            });
        match result {
            Err(error) if error.is_transient_storage_error() => {
                self.disable_network_until_recovery(error);
                Ok(())
            }
            other => other,
        }
    }

    fn on_watch_stream_close(&self, error: FirestoreError) {
        self.state.lock().unwrap().aggregator = None;

        if self.should_start_watch_stream() {
            self.online_state.handle_watch_stream_failure(&error);
            self.start_watch_stream();
        } else {
            // No targets left, or the network was disabled.
            self.online_state.set(OnlineState::Unknown);
        }
    }

    /// Turns the accumulated changes into a remote event. Targets whose
    /// existence filter did not match are re-listened from scratch.
    fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let Some(event) = self.with_aggregator(|aggregator| aggregator.create_remote_event(snapshot_version))
        else {
            return Ok(());
        };

        {
            let mut targets = self.listen_targets.lock().unwrap();
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get(target_id).cloned() {
                    targets.insert(
                        *target_id,
                        target_data.with_resume_token(change.resume_token.clone(), snapshot_version),
                    );
                }
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.lock().unwrap().get(target_id).cloned() else {
                continue;
            };
            // Keep the snapshot version so the next listen still reports the
            // cached results as synced up to it.
            let cleared = target_data
                .clone()
                .with_resume_token(Vec::new(), target_data.snapshot_version);
            self.listen_targets.lock().unwrap().insert(*target_id, cleared);

            self.send_unwatch_request(*target_id)?;
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(request)?;
        }

        match self.syncer() {
            Some(syncer) => syncer.apply_remote_event(event),
            None => Ok(()),
        }
    }

    fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(error) = change.cause.clone() else {
            return Ok(());
        };
        for target_id in &change.target_ids {
            if self.listen_targets.lock().unwrap().remove(target_id).is_none() {
                continue;
            }
            self.with_aggregator(|aggregator| aggregator.remove_target(*target_id));
            if let Some(syncer) = self.syncer() {
                syncer.reject_listen(*target_id, error.clone())?;
            }
        }
        Ok(())
    }

    /// Takes the network down after the local store failed transiently and
    /// probes it until it recovers.
    fn disable_network_until_recovery(&self, error: FirestoreError) {
        log::warn!("Disabling network while the local store recovers: {error}");
        self.add_offline_cause(OfflineCause::StorageFailure);
        self.disable_network_internal();
        self.online_state.set(OnlineState::Offline);

        let me = self.me.clone();
        self.queue.enqueue_retryable(move || {
            let me = me.clone();
            async move {
                let Some(inner) = me.upgrade() else {
                    return Ok(());
                };
                inner.local_store.last_remote_snapshot_version()?;
                log::debug!("local store recovered, enabling network");
                inner.remove_offline_cause(OfflineCause::StorageFailure);
                inner.enable_network_internal()
            }
        });
    }

    // Write stream

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network()
            && !self.write_stream.is_started()
            && !self.state.lock().unwrap().write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.offline_causes.is_empty() && state.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        while self.can_add_to_write_pipeline() {
            let last_batch_id = self
                .state
                .lock()
                .unwrap()
                .write_pipeline
                .back()
                .map(MutationBatch::batch_id);
            let Some(batch) = self.local_store.next_mutation_batch(last_batch_id)? else {
                break;
            };
            self.add_to_write_pipeline(batch)?;
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let ready = self.write_stream.is_open() && self.write_stream.handshake_complete();
        if ready {
            self.write_stream.write_mutations(batch.mutations())?;
        }
        self.state.lock().unwrap().write_pipeline.push_back(batch);
        Ok(())
    }

    fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake()
    }

    fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        self.local_store
            .set_last_stream_token(self.write_stream.last_stream_token())?;
        let batches: Vec<MutationBatch> =
            self.state.lock().unwrap().write_pipeline.iter().cloned().collect();
        for batch in batches {
            self.write_stream.write_mutations(batch.mutations())?;
        }
        Ok(())
    }

    fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let Some(batch) = self.state.lock().unwrap().write_pipeline.pop_front() else {
            log::warn!("received a write acknowledgement with an empty pipeline");
            return Ok(());
        };
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        )?;
        if let Some(syncer) = self.syncer() {
            match syncer.apply_successful_write(result) {
                Err(error) if error.is_transient_storage_error() => {
                    self.disable_network_until_recovery(error);
                    return Ok(());
                }
                other => other?,
            }
        }
        self.fill_write_pipeline()
    }

    fn on_write_stream_close(&self, error: FirestoreError) {
        if let Err(failure) = self.handle_write_error(&error) {
            log::warn!("failed to handle write stream error {error}: {failure}");
        }
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }

    fn handle_write_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if self.write_stream.handshake_complete() {
            if !error.code.is_permanent_write_error() {
                return Ok(());
            }
            let Some(batch) = self.state.lock().unwrap().write_pipeline.pop_front() else {
                return Ok(());
            };
            // The next batch may succeed, so reconnect right away.
            self.write_stream.inhibit_backoff();
            if let Some(syncer) = self.syncer() {
                syncer.reject_failed_write(batch.batch_id(), error.clone())?;
            }
            self.fill_write_pipeline()
        } else {
            if error.code.is_permanent() {
                log::debug!("write stream handshake failed, resetting stream token: {error}");
                self.write_stream.set_last_stream_token(Vec::new());
                self.local_store.set_last_stream_token(Vec::new())?;
            }
            Ok(())
        }
    }
}

struct RemoteListenDelegate {
    inner: Weak<RemoteStoreInner>,
}

impl ListenStreamDelegate for RemoteListenDelegate {
    fn on_listen_open(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_open(),
            None => Ok(()),
        }
    }

    fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_change(change, snapshot_version),
            None => Ok(()),
        }
    }

    fn on_listen_close(&self, error: FirestoreError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_stream_close(error);
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

impl WriteStreamDelegate for RemoteWriteDelegate {
    fn on_write_open(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_open(),
            None => Ok(()),
        }
    }

    fn on_handshake_complete(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete(),
            None => Ok(()),
        }
    }

    fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_mutation_result(commit_version, results),
            None => Ok(()),
        }
    }

    fn on_write_close(&self, error: FirestoreError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_stream_close(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, unauthenticated};
    use crate::firestore::local::{MemoryPersistence, TargetPurpose};
    use crate::firestore::model::{BatchId, DatabaseId, Mutation};
    use crate::firestore::remote::datastore::{StaticCredentialsProvider, Token};
    use crate::firestore::remote::network::RetrySettings;
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::stream::AcceptedStream;
    use crate::firestore::test_support::{
        key, map, query, receive, respond, spin_until, version, watch, FakeBackend,
    };
    use crate::firestore::value::FirestoreValue;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSyncer {
        events: Mutex<Vec<RemoteEvent>>,
        rejected_listens: Mutex<Vec<TargetId>>,
        acknowledged: Mutex<Vec<BatchId>>,
        rejected_writes: Mutex<Vec<BatchId>>,
        online_states: Mutex<Vec<OnlineState>>,
        remote_keys: Mutex<BTreeMap<TargetId, DocumentKeySet>>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        fn reject_listen(&self, target_id: TargetId, _error: FirestoreError) -> FirestoreResult<()> {
            self.rejected_listens.lock().unwrap().push(target_id);
            Ok(())
        }

        fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
            self.acknowledged.lock().unwrap().push(result.batch.batch_id());
            Ok(())
        }

        fn reject_failed_write(&self, batch_id: BatchId, _error: FirestoreError) -> FirestoreResult<()> {
            self.rejected_writes.lock().unwrap().push(batch_id);
            Ok(())
        }

        fn apply_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }

        fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    struct Fixture {
        backend: FakeBackend,
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        store: RemoteStore,
        syncer: Arc<RecordingSyncer>,
    }

    fn fixture() -> Fixture {
        let (datastore, backend) = FakeBackend::loopback();
        let queue = AsyncQueue::new();
        let credentials = Arc::new(StaticCredentialsProvider::new(Some(Token::new("token"))));
        let layer = NetworkLayer::builder(datastore, credentials)
            .with_retry(RetrySettings {
                initial_delay: Duration::from_millis(10),
                multiplier: 1.5,
                max_delay: Duration::from_millis(50),
            })
            .build(queue.clone());
        let local_store = Arc::new(LocalStore::new(Arc::new(MemoryPersistence::new())));
        let store = RemoteStore::new(
            Arc::clone(&local_store),
            &layer,
            JsonProtoSerializer::new(DatabaseId::default("project")),
            Duration::from_secs(10),
        );
        let syncer = Arc::new(RecordingSyncer::default());
        let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
        store.set_syncer(weak);
        Fixture {
            backend,
            queue,
            local_store,
            store,
            syncer,
        }
    }

    async fn on_queue<T, F>(fixture: &Fixture, action: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(RemoteStore) -> FirestoreResult<T> + Send + 'static,
    {
        let store = fixture.store.clone();
        fixture
            .queue
            .enqueue(async move { action(store) })
            .await
            .unwrap()
    }

    fn listen_target(fixture: &Fixture, path: &str) -> TargetData {
        fixture
            .local_store
            .allocate_target(query(path).to_target())
            .unwrap()
    }

    async fn listen(fixture: &mut Fixture, path: &str) -> (TargetData, AcceptedStream) {
        let target = listen_target(fixture, path);
        let request = target.clone();
        on_queue(fixture, move |store| {
            store.start()?;
            store.listen(request)
        })
        .await;
        let accepted = fixture.backend.accept_listen().await;
        let add = receive(&accepted).await;
        assert_eq!(add["addTarget"]["targetId"], json!(target.target_id));
        (target, accepted)
    }

    #[tokio::test]
    async fn listen_raises_remote_events_at_global_snapshots() {
        let mut fixture = fixture();
        let (target, accepted) = listen(&mut fixture, "rooms").await;
        let id = target.target_id;

        for message in [
            watch::target_change("ADD", &[id], None),
            watch::document("rooms/a", 1, json!({ "n": { "integerValue": "1" } }), &[id]),
            watch::target_change("CURRENT", &[id], Some(&BASE64_STANDARD.encode(b"r1"))),
        ] {
            respond(&accepted, message).await;
        }
        assert!(spin_until(|| fixture.store.online_state() == OnlineState::Online).await);
        assert!(fixture.syncer.events.lock().unwrap().is_empty());

        respond(&accepted, watch::global_snapshot(2)).await;
        let syncer = Arc::clone(&fixture.syncer);
        assert!(spin_until(|| syncer.events.lock().unwrap().len() == 1).await);

        let events = fixture.syncer.events.lock().unwrap();
        let event = &events[0];
        assert_eq!(event.snapshot_version, version(2));
        assert!(event.document_updates.contains_key(&key("rooms/a")));
        let change = &event.target_changes[&id];
        assert!(change.current);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert_eq!(
            *fixture.syncer.online_states.lock().unwrap().last().unwrap(),
            OnlineState::Online
        );
    }

    #[tokio::test]
    async fn listen_is_resent_with_resume_token_after_reconnect() {
        let mut fixture = fixture();
        let (target, accepted) = listen(&mut fixture, "rooms").await;
        let id = target.target_id;

        respond(&accepted, watch::target_change("ADD", &[id], None)).await;
        respond(&accepted, watch::target_change("CURRENT", &[id], Some(&BASE64_STANDARD.encode(b"r1")))).await;
        respond(&accepted, watch::global_snapshot(3)).await;
        let syncer = Arc::clone(&fixture.syncer);
        assert!(spin_until(|| syncer.events.lock().unwrap().len() == 1).await);

        accepted.stream.fail(unauthenticated("expired")).await.unwrap();
        let reopened = fixture.backend.accept_listen().await;
        let add = receive(&reopened).await;
        assert_eq!(add["addTarget"]["targetId"], json!(id));
        assert_eq!(add["addTarget"]["resumeToken"], json!(BASE64_STANDARD.encode(b"r1")));
        assert_eq!(add["addTarget"]["expectedCount"], json!(0));
    }

    #[tokio::test]
    async fn existence_filter_mismatch_relistens_without_resume_token() {
        let mut fixture = fixture();
        let (target, accepted) = listen(&mut fixture, "rooms").await;
        let id = target.target_id;

        respond(&accepted, watch::target_change("ADD", &[id], None)).await;
        respond(&accepted, watch::target_change("CURRENT", &[id], Some(&BASE64_STANDARD.encode(b"r1")))).await;
        respond(&accepted, watch::global_snapshot(1)).await;
        let syncer = Arc::clone(&fixture.syncer);
        assert!(spin_until(|| syncer.events.lock().unwrap().len() == 1).await);

        fixture
            .syncer
            .remote_keys
            .lock()
            .unwrap()
            .insert(id, [key("rooms/a"), key("rooms/b")].into_iter().collect());
        respond(&accepted, watch::existence_filter(id, 1)).await;
        respond(&accepted, watch::global_snapshot(2)).await;

        let remove = receive(&accepted).await;
        assert_eq!(remove["removeTarget"], json!(id));
        let add = receive(&accepted).await;
        assert_eq!(add["addTarget"]["targetId"], json!(id));
        assert!(add["addTarget"].get("resumeToken").is_none());
        assert_eq!(add["labels"]["goog-listen-tags"], json!("existence-filter-mismatch"));

        assert!(spin_until(|| syncer.events.lock().unwrap().len() == 2).await);
        let events = fixture.syncer.events.lock().unwrap();
        assert_eq!(
            events[1].target_mismatches.get(&id),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        // Nothing is removed on an ambiguous filter.
        assert!(events[1].document_updates.is_empty());
    }

    #[tokio::test]
    async fn rejected_listen_is_reported() {
        let mut fixture = fixture();
        let (target, accepted) = listen(&mut fixture, "rooms").await;
        let id = target.target_id;

        respond(
            &accepted,
            json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [id],
                    "cause": { "code": 7, "message": "denied" }
                }
            }),
        )
        .await;
        let syncer = Arc::clone(&fixture.syncer);
        assert!(spin_until(|| syncer.rejected_listens.lock().unwrap().as_slice() == [id]).await);
    }

    fn set_mutation(path: &str, value: i64) -> Mutation {
        Mutation::set(key(path), map(&[("n", FirestoreValue::from(value))]))
    }

    async fn complete_handshake(fixture: &mut Fixture) -> AcceptedStream {
        let accepted = fixture.backend.accept_write().await;
        let handshake = receive(&accepted).await;
        assert_eq!(handshake["database"], json!("projects/project/databases/(default)"));
        respond(&accepted, json!({ "streamToken": BASE64_STANDARD.encode(b"s1") })).await;
        accepted
    }

    #[tokio::test]
    async fn write_pipeline_streams_batches_and_applies_acks() {
        let mut fixture = fixture();
        let first = fixture.local_store.write_locally(vec![set_mutation("rooms/a", 1)]).unwrap();
        let second = fixture.local_store.write_locally(vec![set_mutation("rooms/b", 2)]).unwrap();
        on_queue(&fixture, |store| store.start()).await;
        assert_eq!(fixture.store.write_pipeline_len(), 2);

        let accepted = complete_handshake(&mut fixture).await;
        let write = receive(&accepted).await;
        assert_eq!(write["streamToken"], json!(BASE64_STANDARD.encode(b"s1")));
        assert!(write["writes"][0]["update"]["name"]
            .as_str()
            .unwrap()
            .ends_with("rooms/a"));
        receive(&accepted).await;

        respond(
            &accepted,
            json!({
                "streamToken": BASE64_STANDARD.encode(b"s2"),
                "commitTime": watch::timestamp(5),
                "writeResults": [{ "updateTime": watch::timestamp(5) }]
            }),
        )
        .await;
        let syncer = Arc::clone(&fixture.syncer);
        assert!(spin_until(|| syncer.acknowledged.lock().unwrap().len() == 1).await);
        assert_eq!(fixture.syncer.acknowledged.lock().unwrap()[0], first.batch_id);
        assert_eq!(fixture.store.write_pipeline_len(), 1);
        assert_eq!(fixture.local_store.last_stream_token().unwrap(), b"s1".to_vec());

        accepted.stream.fail(permission_denied("no")).await.unwrap();
        assert!(spin_until(|| syncer.rejected_writes.lock().unwrap().len() == 1).await);
        assert_eq!(fixture.syncer.rejected_writes.lock().unwrap()[0], second.batch_id);
    }

    #[tokio::test]
    async fn disabled_network_holds_writes_until_enabled() {
        let mut fixture = fixture();
        on_queue(&fixture, |store| {
            store.start()?;
            store.disable_network();
            Ok(())
        })
        .await;
        assert_eq!(fixture.store.online_state(), OnlineState::Offline);

        fixture.local_store.write_locally(vec![set_mutation("rooms/a", 1)]).unwrap();
        on_queue(&fixture, |store| store.fill_write_pipeline()).await;
        assert_eq!(fixture.store.write_pipeline_len(), 0);
        assert_eq!(fixture.store.write_stream_state(), StreamState::Stopped);

        on_queue(&fixture, |store| store.enable_network()).await;
        let accepted = complete_handshake(&mut fixture).await;
        let write = receive(&accepted).await;
        assert_eq!(write["writes"].as_array().unwrap().len(), 1);
    }
}
