use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use firestore_sync_engine::firestore::core::ChangeType;
use firestore_sync_engine::firestore::model::{DatabaseId, DocumentKey, Mutation, ResourcePath};
use firestore_sync_engine::firestore::remote::datastore::streaming::{LISTEN_ROUTE, WRITE_ROUTE};
use firestore_sync_engine::firestore::remote::{
    AcceptedStream, EmptyCredentialsProvider, InMemoryTransport, MultiplexedConnection,
    RetrySettings, StreamingDatastoreImpl,
};
use firestore_sync_engine::firestore::value::{FirestoreValue, MapValue};
use firestore_sync_engine::firestore::{
    ClientSettings, FirestoreClient, ListenOptions, Query, QueryObserver, ViewSnapshot,
};
use firestore_sync_engine::firestore::core::OrderDirection;
use firestore_sync_engine::firestore::error::{aborted, failed_precondition};
use firestore_sync_engine::firestore::local::persistence::TransactionBody;
use firestore_sync_engine::firestore::local::{
    DocumentOverlayCache, MemoryPersistence, MutationQueue, Persistence, RemoteDocumentCache,
    TargetCache,
};
use firestore_sync_engine::firestore::{FirestoreErrorCode, FirestoreResult};
use firestore_sync_engine::util::BackoffConfig;
use serde_json::{json, Value};

const TIMEOUT: Duration = Duration::from_secs(5);
const DOCUMENTS: &str = "projects/project/databases/(default)/documents";

/// Test side of the loopback connection.
struct Backend {
    server: MultiplexedConnection,
    parked: Vec<AcceptedStream>,
}

impl Backend {
    async fn accept(&mut self, route: &str) -> AcceptedStream {
        if let Some(position) = self.parked.iter().position(|s| s.metadata.route == route) {
            return self.parked.remove(position);
        }
        loop {
            let accepted = tokio::time::timeout(TIMEOUT, self.server.accept_stream())
                .await
                .expect("stream opened in time")
                .expect("connection open");
            if accepted.metadata.route == route {
                return accepted;
            }
            self.parked.push(accepted);
        }
    }

    /// Accepts the write stream and completes its handshake.
    async fn accept_write(&mut self) -> AcceptedStream {
        let accepted = self.accept(WRITE_ROUTE).await;
        let handshake = receive(&accepted).await;
        assert_eq!(handshake["database"], json!("projects/project/databases/(default)"));
        respond(&accepted, json!({ "streamToken": BASE64_STANDARD.encode(b"t0") })).await;
        accepted
    }
}

async fn receive(accepted: &AcceptedStream) -> Value {
    let frame = tokio::time::timeout(TIMEOUT, accepted.stream.next())
        .await
        .expect("request in time")
        .expect("stream open")
        .expect("request frame");
    serde_json::from_slice(&frame).expect("json request")
}

async fn respond(accepted: &AcceptedStream, message: Value) {
    accepted
        .stream
        .send(serde_json::to_vec(&message).unwrap())
        .await
        .unwrap();
}

fn timestamp(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .unwrap()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn write_ack(seconds: i64) -> Value {
    json!({
        "streamToken": BASE64_STANDARD.encode(format!("t{seconds}")),
        "commitTime": timestamp(seconds),
        "writeResults": [{ "updateTime": timestamp(seconds) }]
    })
}

fn target_change(kind: &str, target_id: i64, resume_token: Option<&[u8]>) -> Value {
    let mut change = json!({ "targetChangeType": kind, "targetIds": [target_id] });
    if let Some(token) = resume_token {
        change["resumeToken"] = json!(BASE64_STANDARD.encode(token));
    }
    json!({ "targetChange": change })
}

fn document_change(path: &str, seconds: i64, fields: Value, target_id: i64) -> Value {
    json!({
        "documentChange": {
            "document": {
                "name": format!("{DOCUMENTS}/{path}"),
                "fields": fields,
                "updateTime": timestamp(seconds),
            },
            "targetIds": [target_id],
        }
    })
}

fn global_snapshot(seconds: i64) -> Value {
    json!({ "targetChange": { "readTime": timestamp(seconds) } })
}

/// Memory persistence whose named transactions fail with `aborted` a set
/// number of times, like a store briefly locked by another process.
struct LockedOnce {
    inner: MemoryPersistence,
    failures: Mutex<HashMap<&'static str, usize>>,
}

impl LockedOnce {
    fn new(actions: &[&'static str]) -> Self {
        Self {
            inner: MemoryPersistence::new(),
            failures: Mutex::new(actions.iter().map(|action| (*action, 1)).collect()),
        }
    }

    fn remaining_failures(&self) -> usize {
        self.failures.lock().unwrap().values().sum()
    }
}

impl Persistence for LockedOnce {
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
                return Err(aborted(format!("{action}: store locked")));
            }
        }
        self.inner.run_transaction(action, body)
    }
}

async fn start_client() -> (FirestoreClient, Backend) {
    start_client_over(Arc::new(MemoryPersistence::new())).await
}

async fn start_client_over(persistence: Arc<dyn Persistence>) -> (FirestoreClient, Backend) {
    let (client_side, server_side) = InMemoryTransport::pair();
    let datastore = Arc::new(StreamingDatastoreImpl::new(
        Arc::new(MultiplexedConnection::new(client_side)),
        DatabaseId::default("project"),
    ));
    let client = FirestoreClient::new(
        DatabaseId::default("project"),
        persistence,
        datastore,
        Arc::new(EmptyCredentialsProvider),
        ClientSettings::default()
            .with_stream_retry(RetrySettings {
                initial_delay: Duration::from_millis(10),
                multiplier: 1.5,
                max_delay: Duration::from_millis(50),
            })
            .with_storage_retry(BackoffConfig {
                initial_delay: Duration::from_millis(5),
                backoff_factor: 1.5,
                max_delay: Duration::from_millis(20),
            }),
    )
    .await
    .expect("client starts");
    let backend = Backend {
        server: MultiplexedConnection::new(server_side),
        parked: Vec::new(),
    };
    (client, backend)
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn collection(path: &str) -> Query {
    Query::collection(ResourcePath::from_string(path).unwrap())
}

fn fields(entries: &[(&str, FirestoreValue)]) -> MapValue {
    MapValue::new(
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn recorder() -> (QueryObserver, Arc<Mutex<Vec<ViewSnapshot>>>) {
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let observer = QueryObserver::new(move |snapshot| sink.lock().unwrap().push(snapshot));
    (observer, snapshots)
}

/// Waits for a snapshot matching `condition` and returns it.
async fn wait_for_snapshot<F>(snapshots: &Mutex<Vec<ViewSnapshot>>, condition: F) -> ViewSnapshot
where
    F: Fn(&ViewSnapshot) -> bool,
{
    for _ in 0..1_000 {
        if let Some(found) = snapshots.lock().unwrap().iter().rev().find(|s| condition(s)) {
            return found.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no matching snapshot in {:?}", snapshots.lock().unwrap());
}

async fn wait_for_cached<F>(client: &FirestoreClient, path: &str, condition: F) -> MapValue
where
    F: Fn(&MapValue) -> bool,
{
    for _ in 0..1_000 {
        if let Ok(Some(document)) = client.get_document_from_cache(key(path)).await {
            if condition(document.data()) {
                return document.data().clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{path} never reached the expected state in the cache");
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_visible_then_synced_after_reconnect() {
    let (client, mut backend) = start_client().await;
    client.disable_network().await.unwrap();

    let (observer, snapshots) = recorder();
    let _registration = client.listen(
        collection("d"),
        ListenOptions::default().with_metadata_changes(),
        observer,
    );

    let writer = client.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("d/1"), fields(&[("name", FirestoreValue::from("A"))]))])
            .await
    });

    let expected = fields(&[("name", FirestoreValue::from("A"))]);
    let offline = wait_for_snapshot(&snapshots, |s| s.documents.has(&key("d/1"))).await;
    assert!(offline.from_cache);
    assert!(offline.has_pending_writes());
    assert_eq!(offline.documents.get(&key("d/1")).unwrap().data(), &expected);

    client.enable_network().await.unwrap();
    let listen = backend.accept(LISTEN_ROUTE).await;
    let add = receive(&listen).await;
    let target_id = add["addTarget"]["targetId"].as_i64().expect("target id");

    let writes = backend.accept_write().await;
    let request = receive(&writes).await;
    assert_eq!(request["writes"][0]["update"]["name"], json!(format!("{DOCUMENTS}/d/1")));
    respond(&writes, write_ack(2)).await;
    tokio::time::timeout(TIMEOUT, write)
        .await
        .expect("write resolves")
        .unwrap()
        .expect("write acknowledged");

    for message in [
        target_change("ADD", target_id, None),
        document_change("d/1", 2, json!({ "name": { "stringValue": "A" } }), target_id),
        target_change("CURRENT", target_id, Some(b"r1")),
        global_snapshot(2),
    ] {
        respond(&listen, message).await;
    }

    let synced = wait_for_snapshot(&snapshots, |s| !s.from_cache).await;
    assert!(!synced.has_pending_writes());
    assert_eq!(synced.document_keys(), vec![key("d/1")]);
    assert_eq!(synced.documents.get(&key("d/1")).unwrap().data(), &expected);

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn patch_merges_onto_acknowledged_set() {
    let (client, mut backend) = start_client().await;
    let expected = fields(&[("a", FirestoreValue::from(1_i64)), ("b", FirestoreValue::from(2_i64))]);

    let writer = client.clone();
    let set = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("d/1"), fields(&[("a", FirestoreValue::from(1_i64))]))])
            .await
    });
    wait_for_cached(&client, "d/1", |data| !data.is_empty()).await;

    let writer = client.clone();
    let _patch = tokio::spawn(async move {
        writer
            .write(vec![Mutation::patch(key("d/1"), fields(&[("b", FirestoreValue::from(2_i64))]))])
            .await
    });
    let pending = wait_for_cached(&client, "d/1", |data| data.fields().len() == 2).await;
    assert_eq!(pending, expected);

    let writes = backend.accept_write().await;
    let first = receive(&writes).await;
    assert!(first["writes"][0].get("update").is_some());
    let second = receive(&writes).await;
    assert!(second["writes"][0].get("updateMask").is_some());

    respond(&writes, write_ack(3)).await;
    tokio::time::timeout(TIMEOUT, set)
        .await
        .expect("set resolves")
        .unwrap()
        .expect("set acknowledged");

    let after_ack = client
        .get_document_from_cache(key("d/1"))
        .await
        .unwrap()
        .expect("document in cache");
    assert_eq!(after_ack.data(), &expected);
    assert!(after_ack.has_local_mutations());

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_the_top_document_promotes_the_next_in_one_snapshot() {
    let (client, mut backend) = start_client().await;
    let top = collection("rooms")
        .order_by("score", OrderDirection::Descending)
        .unwrap()
        .limit_to_first(1)
        .unwrap();

    let (observer, snapshots) = recorder();
    let _registration = client.listen(top, ListenOptions::default(), observer);

    let listen = backend.accept(LISTEN_ROUTE).await;
    let add = receive(&listen).await;
    let target_id = add["addTarget"]["targetId"].as_i64().expect("target id");
    for message in [
        target_change("ADD", target_id, None),
        document_change("rooms/a", 1, json!({ "score": { "integerValue": "2" } }), target_id),
        document_change("rooms/b", 1, json!({ "score": { "integerValue": "1" } }), target_id),
        target_change("CURRENT", target_id, Some(b"r1")),
        global_snapshot(1),
    ] {
        respond(&listen, message).await;
    }

    let synced = wait_for_snapshot(&snapshots, |s| !s.from_cache).await;
    assert_eq!(synced.document_keys(), vec![key("rooms/a")]);
    let raised_before_delete = snapshots.lock().unwrap().len();

    let writer = client.clone();
    let _delete = tokio::spawn(async move { writer.write(vec![Mutation::delete(key("rooms/a"))]).await });

    let promoted = wait_for_snapshot(&snapshots, |s| s.documents.has(&key("rooms/b"))).await;
    assert_eq!(snapshots.lock().unwrap().len(), raised_before_delete + 1);
    assert_eq!(promoted.document_keys(), vec![key("rooms/b")]);
    let changes: Vec<(ChangeType, DocumentKey)> = promoted
        .doc_changes
        .iter()
        .map(|change| (change.change_type, change.document.key().clone()))
        .collect();
    assert_eq!(
        changes,
        vec![
            (ChangeType::Removed, key("rooms/a")),
            (ChangeType::Added, key("rooms/b")),
        ]
    );

    // Both documents were reported by the target, so nothing is probed.
    let extra = tokio::time::timeout(Duration::from_millis(200), listen.stream.next()).await;
    assert!(extra.is_err(), "unexpected listen request {extra:?}");

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_reveals_the_latest_server_document() {
    let (client, mut backend) = start_client().await;
    let (observer, snapshots) = recorder();
    let _registration = client.listen(collection("rooms"), ListenOptions::default(), observer);

    let listen = backend.accept(LISTEN_ROUTE).await;
    let add = receive(&listen).await;
    let target_id = add["addTarget"]["targetId"].as_i64().expect("target id");
    for message in [
        target_change("ADD", target_id, None),
        document_change("rooms/a", 2, json!({ "v": { "integerValue": "2" } }), target_id),
        target_change("CURRENT", target_id, Some(b"r2")),
        global_snapshot(2),
    ] {
        respond(&listen, message).await;
    }
    wait_for_snapshot(&snapshots, |s| !s.from_cache).await;

    let writer = client.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::patch(key("rooms/a"), fields(&[("mine", FirestoreValue::from(1_i64))]))])
            .await
    });
    let writes = backend.accept_write().await;
    let request = receive(&writes).await;
    assert!(request["writes"][0].get("updateMask").is_some());

    // The server moves on while the patch is in flight.
    for message in [
        document_change("rooms/a", 4, json!({ "v": { "integerValue": "4" } }), target_id),
        target_change("NO_CHANGE", target_id, Some(b"r4")),
        global_snapshot(4),
    ] {
        respond(&listen, message).await;
    }
    let merged = fields(&[("mine", FirestoreValue::from(1_i64)), ("v", FirestoreValue::from(4_i64))]);
    let shadowed = wait_for_snapshot(&snapshots, |s| {
        s.documents.get(&key("rooms/a")).is_some_and(|d| d.data() == &merged)
    })
    .await;
    assert!(shadowed.has_pending_writes());

    writes
        .stream
        .fail(failed_precondition("document was modified"))
        .await
        .unwrap();
    let err = tokio::time::timeout(TIMEOUT, write)
        .await
        .expect("write resolves")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);

    let latest = fields(&[("v", FirestoreValue::from(4_i64))]);
    let reverted = wait_for_snapshot(&snapshots, |s| {
        s.documents.get(&key("rooms/a")).is_some_and(|d| d.data() == &latest)
    })
    .await;
    assert!(!reverted.has_pending_writes());
    let cached = client
        .get_document_from_cache(key("rooms/a"))
        .await
        .unwrap()
        .expect("document in cache");
    assert_eq!(cached.data(), &latest);
    assert!(!cached.has_local_mutations());

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_storage_delays_but_never_fails_user_operations() {
    let persistence = Arc::new(LockedOnce::new(&[
        "Execute query",
        "Locally write mutations",
        "Read document",
    ]));
    let (client, mut backend) = start_client_over(persistence.clone()).await;
    let (observer, snapshots) = recorder();
    let _registration = client.listen(collection("d"), ListenOptions::default(), observer);

    let writer = client.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("d/1"), fields(&[("name", FirestoreValue::from("A"))]))])
            .await
    });
    let local = wait_for_snapshot(&snapshots, |s| s.documents.has(&key("d/1"))).await;
    assert!(local.has_pending_writes());

    let writes = backend.accept_write().await;
    let request = receive(&writes).await;
    assert_eq!(request["writes"][0]["update"]["name"], json!(format!("{DOCUMENTS}/d/1")));
    respond(&writes, write_ack(2)).await;
    tokio::time::timeout(TIMEOUT, write)
        .await
        .expect("write resolves")
        .unwrap()
        .expect("write acknowledged despite the locked store");

    let cached = client
        .get_document_from_cache(key("d/1"))
        .await
        .expect("read retried")
        .expect("document in cache");
    assert_eq!(cached.data(), &fields(&[("name", FirestoreValue::from("A"))]));
    assert_eq!(persistence.remaining_failures(), 0);

    client.terminate().await.unwrap();
}
