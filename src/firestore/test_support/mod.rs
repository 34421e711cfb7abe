use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::firestore::core::Query;
use crate::firestore::error::{aborted, FirestoreResult};
use crate::firestore::local::persistence::TransactionBody;
use crate::firestore::local::{
    DocumentOverlayCache, MemoryPersistence, MutationQueue, Persistence, RemoteDocumentCache,
    TargetCache,
};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, MutableDocument, ResourcePath, SnapshotVersion, Timestamp,
};
use crate::firestore::remote::datastore::streaming::{LISTEN_ROUTE, WRITE_ROUTE};
use crate::firestore::remote::datastore::StreamingDatastoreImpl;
use crate::firestore::remote::stream::{AcceptedStream, InMemoryTransport, MultiplexedConnection};
use crate::firestore::value::{FirestoreValue, MapValue};
use crate::platform::runtime;

/// Polls `condition` until it holds or roughly five seconds pass.
pub(crate) async fn spin_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..1_000 {
        if condition() {
            return true;
        }
        runtime::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub(crate) fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("document key")
}

pub(crate) fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).expect("field path")
}

pub(crate) fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

pub(crate) fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
    let mut value = MapValue::empty();
    for (path, entry) in entries {
        value.set(&field(path), entry.clone());
    }
    value
}

pub(crate) fn doc(path: &str, seconds: i64, entries: &[(&str, FirestoreValue)]) -> MutableDocument {
    MutableDocument::new_found_document(key(path), version(seconds), map(entries))
}

pub(crate) fn deleted_doc(path: &str, seconds: i64) -> MutableDocument {
    MutableDocument::new_no_document(key(path), version(seconds))
}

pub(crate) fn query(path: &str) -> Query {
    Query::collection(ResourcePath::from_string(path).expect("collection path"))
}

/// Memory persistence whose named transactions fail with `aborted` a set
/// number of times before they go through.
pub(crate) struct FlakyPersistence {
    inner: MemoryPersistence,
    failures: Mutex<HashMap<&'static str, usize>>,
}

impl FlakyPersistence {
    pub(crate) fn new(failures: &[(&'static str, usize)]) -> Self {
        Self {
            inner: MemoryPersistence::new(),
            failures: Mutex::new(failures.iter().copied().collect()),
        }
    }

    pub(crate) fn remaining_failures(&self) -> usize {
        self.failures.lock().unwrap().values().sum()
    }
}

impl Persistence for FlakyPersistence {
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
        if let Some(left) = self.failures.lock().unwrap().get_mut(action) {
            if *left > 0 {
                *left -= 1;
                return Err(aborted(format!("'{action}' hit a locked store")));
            }
        }
        self.inner.run_transaction(action, body)
    }
}

/// Server side of a loopback connection. Streams are accepted by route so a
/// test can talk to the listen and write streams independently.
pub(crate) struct FakeBackend {
    server: MultiplexedConnection,
    parked: Vec<AcceptedStream>,
}

impl FakeBackend {
    /// Returns a datastore for the client and the backend it talks to.
    pub(crate) fn loopback() -> (Arc<StreamingDatastoreImpl>, Self) {
        let (client, server) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client));
        let datastore = Arc::new(StreamingDatastoreImpl::new(
            connection,
            DatabaseId::default("project"),
        ));
        let backend = Self {
            server: MultiplexedConnection::new(server),
            parked: Vec::new(),
        };
        (datastore, backend)
    }

    pub(crate) async fn accept(&mut self, route: &str) -> AcceptedStream {
        if let Some(position) = self.parked.iter().position(|s| s.metadata.route == route) {
            return self.parked.remove(position);
        }
        loop {
            let accepted = tokio::time::timeout(TEST_TIMEOUT, self.server.accept_stream())
                .await
                .expect("stream opened in time")
                .expect("connection open");
            if accepted.metadata.route == route {
                return accepted;
            }
            self.parked.push(accepted);
        }
    }

    pub(crate) async fn accept_listen(&mut self) -> AcceptedStream {
        self.accept(LISTEN_ROUTE).await
    }

    pub(crate) async fn accept_write(&mut self) -> AcceptedStream {
        self.accept(WRITE_ROUTE).await
    }
}

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn receive(accepted: &AcceptedStream) -> JsonValue {
    let frame = tokio::time::timeout(TEST_TIMEOUT, accepted.stream.next())
        .await
        .expect("request in time")
        .expect("stream open")
        .expect("request frame");
    serde_json::from_slice(&frame).expect("json request")
}

pub(crate) async fn respond(accepted: &AcceptedStream, message: JsonValue) {
    accepted
        .stream
        .send(serde_json::to_vec(&message).expect("json response"))
        .await
        .expect("response sent");
}

/// Response frames of the listen protocol.
pub(crate) mod watch {
    use serde_json::{json, Value as JsonValue};

    pub(crate) fn timestamp(seconds: i64) -> String {
        chrono::DateTime::from_timestamp(seconds, 0)
            .expect("timestamp")
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    pub(crate) fn target_change(kind: &str, target_ids: &[i32], resume_token: Option<&str>) -> JsonValue {
        let mut change = json!({ "targetChangeType": kind, "targetIds": target_ids });
        if let Some(token) = resume_token {
            change["resumeToken"] = json!(token);
        }
        json!({ "targetChange": change })
    }

    pub(crate) fn global_snapshot(seconds: i64) -> JsonValue {
        json!({ "targetChange": { "readTime": timestamp(seconds) } })
    }

    pub(crate) fn document(name: &str, seconds: i64, fields: JsonValue, target_ids: &[i32]) -> JsonValue {
        json!({
            "documentChange": {
                "document": {
                    "name": format!("projects/project/databases/(default)/documents/{name}"),
                    "fields": fields,
                    "updateTime": timestamp(seconds),
                },
                "targetIds": target_ids,
            }
        })
    }

    pub(crate) fn existence_filter(target_id: i32, count: i32) -> JsonValue {
        json!({ "filter": { "targetId": target_id, "count": count } })
    }
}
