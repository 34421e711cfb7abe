use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::firestore::core::TargetId;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamDelegate, StreamState};
use crate::firestore::remote::watch_change::{decode_watch_change, TargetChangeState, WatchChange};

/// Events of the listen stream, decoded. Runs on the stream's queue.
pub trait ListenStreamDelegate: Send + Sync + 'static {
    fn on_listen_open(&self) -> FirestoreResult<()>;

    /// `snapshot_version` is the read time of a global target change, and
    /// `SnapshotVersion::min()` for every other message.
    fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()>;

    fn on_listen_close(&self, error: FirestoreError);
}

/// The `Listen` RPC: add and remove targets, receive watch changes.
pub struct ListenStream<D>
where
    D: ListenStreamDelegate,
{
    stream: PersistentStream<ListenStreamHandler<D>>,
    serializer: Arc<JsonProtoSerializer>,
}

impl<D> ListenStream<D>
where
    D: ListenStreamDelegate,
{
    pub fn new(layer: &NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let serializer = Arc::new(serializer);
        let handler = Arc::new(ListenStreamHandler {
            serializer: Arc::clone(&serializer),
            delegate,
        });
        Self {
            stream: layer.listen(handler),
            serializer,
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) {
        self.stream.stop();
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    /// Sends `addTarget` for `target_data`.
    pub fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let mut request = serde_json::Map::new();
        request.insert("database".to_string(), json!(self.serializer.database_name()));
        request.insert(
            "addTarget".to_string(),
            self.serializer.encode_target(target_data)?,
        );
        if let Some(tag) = listen_tag(target_data.purpose) {
            request.insert("labels".to_string(), json!({ "goog-listen-tags": tag }));
        }
        self.send(JsonValue::Object(request))
    }

    /// Sends `removeTarget` for `target_id`.
    pub fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.send(json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        }))
    }

    fn send(&self, request: JsonValue) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode listen request: {err}")))?;
        self.stream.send(bytes)
    }
}

fn listen_tag(purpose: TargetPurpose) -> Option<&'static str> {
    match purpose {
        TargetPurpose::Listen => None,
        TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
        TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
        TargetPurpose::LimboResolution => Some("limbo-document"),
    }
}

struct ListenStreamHandler<D> {
    serializer: Arc<JsonProtoSerializer>,
    delegate: Arc<D>,
}

impl<D> PersistentStreamDelegate for ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn on_stream_open(&self) -> FirestoreResult<()> {
        self.delegate.on_listen_open()
    }

    fn on_stream_message(&self, message: Vec<u8>) -> FirestoreResult<()> {
        let value: JsonValue = serde_json::from_slice(&message)
            .map_err(|err| internal_error(format!("Failed to decode listen response: {err}")))?;
        let Some(change) = decode_watch_change(&self.serializer, &value)? else {
            log::debug!("ignoring unrecognized listen response");
            return Ok(());
        };
        let snapshot_version = snapshot_version_of(&change);
        self.delegate.on_watch_change(change, snapshot_version)
    }

    fn on_stream_close(&self, error: FirestoreError) {
        self.delegate.on_listen_close(error);
    }
}

/// Only a global `NO_CHANGE` marks a consistent snapshot.
fn snapshot_version_of(change: &WatchChange) -> SnapshotVersion {
    match change {
        WatchChange::TargetChange(change)
            if change.state == TargetChangeState::NoChange && change.target_ids.is_empty() =>
        {
            change.read_time
        }
        _ => SnapshotVersion::min(),
    }
}
