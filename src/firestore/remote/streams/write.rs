use std::sync::{Arc, Mutex};

use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamDelegate, StreamState};

/// Events of the write stream. Runs on the stream's queue.
pub trait WriteStreamDelegate: Send + Sync + 'static {
    /// The stream is open; the handshake has to be sent next.
    fn on_write_open(&self) -> FirestoreResult<()>;

    fn on_handshake_complete(&self) -> FirestoreResult<()>;

    fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;

    fn on_write_close(&self, error: FirestoreError);
}

/// The `Write` RPC. A handshake obtains a stream token, after which batches
/// of mutations are acknowledged in order.
pub struct WriteStream<D>
where
    D: WriteStreamDelegate,
{
    stream: PersistentStream<WriteStreamHandler<D>>,
    serializer: Arc<JsonProtoSerializer>,
    progress: Arc<Mutex<WriteProgress>>,
}

#[derive(Default)]
struct WriteProgress {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl<D> WriteStream<D>
where
    D: WriteStreamDelegate,
{
    pub fn new(layer: &NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let serializer = Arc::new(serializer);
        let progress = Arc::new(Mutex::new(WriteProgress::default()));
        let handler = Arc::new(WriteStreamHandler {
            serializer: Arc::clone(&serializer),
            progress: Arc::clone(&progress),
            delegate,
        });
        Self {
            stream: layer.write(handler),
            serializer,
            progress,
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) {
        self.stream.stop();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
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

    pub fn handshake_complete(&self) -> bool {
        self.progress.lock().unwrap().handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.progress.lock().unwrap().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        self.progress.lock().unwrap().last_stream_token = token;
    }

    /// First request on a fresh stream. Carries the last stream token so the
    /// backend can resume the session.
    pub fn write_handshake(&self) -> FirestoreResult<()> {
        let token = {
            let progress = self.progress.lock().unwrap();
            if progress.handshake_complete {
                return Err(internal_error("Write handshake already completed"));
            }
            progress.last_stream_token.clone()
        };
        let mut request = serde_json::Map::new();
        request.insert("database".to_string(), json!(self.serializer.database_name()));
        if !token.is_empty() {
            request.insert(
                "streamToken".to_string(),
                json!(self.serializer.encode_bytes(&token)),
            );
        }
        self.send(JsonValue::Object(request))
    }

    pub fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let token = {
            let progress = self.progress.lock().unwrap();
            if !progress.handshake_complete {
                return Err(invalid_argument(
                    "Cannot write mutations before the handshake completes",
                ));
            }
            progress.last_stream_token.clone()
        };
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        self.send(json!({
            "streamToken": self.serializer.encode_bytes(&token),
            "writes": writes,
        }))
    }

    fn send(&self, request: JsonValue) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode write request: {err}")))?;
        self.stream.send(bytes)
    }
}

struct WriteStreamHandler<D> {
    serializer: Arc<JsonProtoSerializer>,
    progress: Arc<Mutex<WriteProgress>>,
    delegate: Arc<D>,
}

impl<D> PersistentStreamDelegate for WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn on_stream_open(&self) -> FirestoreResult<()> {
        self.progress.lock().unwrap().handshake_complete = false;
        self.delegate.on_write_open()
    }

    fn on_stream_message(&self, message: Vec<u8>) -> FirestoreResult<()> {
        let value: JsonValue = serde_json::from_slice(&message)
            .map_err(|err| internal_error(format!("Failed to decode write response: {err}")))?;
        let stream_token = value
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .map(|token| self.serializer.decode_bytes(token))
            .transpose()?
            .ok_or_else(|| internal_error("Write response missing streamToken"))?;

        let handshake = {
            let mut progress = self.progress.lock().unwrap();
            progress.last_stream_token = stream_token;
            let handshake = !progress.handshake_complete;
            progress.handshake_complete = true;
            handshake
        };

        if handshake {
            return self.delegate.on_handshake_complete();
        }

        let commit_version = value
            .get("commitTime")
            .and_then(JsonValue::as_str)
            .map(|time| self.serializer.decode_version(time))
            .transpose()?
            .ok_or_else(|| internal_error("Write response missing commitTime"))?;
        let results = value
            .get("writeResults")
            .and_then(JsonValue::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| self.serializer.decode_write_result(entry, commit_version))
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        self.delegate.on_mutation_result(commit_version, results)
    }

    /// `handshake_complete` still reflects the failed connection here so the
    /// delegate can tell handshake failures from write failures.
    fn on_stream_close(&self, error: FirestoreError) {
        self.delegate.on_write_close(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::datastore::{EmptyCredentialsProvider, StreamingDatastoreImpl};
    use crate::firestore::remote::stream::{AcceptedStream, InMemoryTransport, MultiplexedConnection};
    use crate::firestore::test_support::{key, map, spin_until, version};
    use crate::firestore::util::AsyncQueue;
    use crate::firestore::value::FirestoreValue;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;

    #[derive(Default)]
    struct RecordingDelegate {
        stream: Mutex<Option<Arc<WriteStream<RecordingDelegate>>>>,
        handshakes: Mutex<usize>,
        results: Mutex<Vec<(SnapshotVersion, Vec<MutationResult>)>>,
    }

    impl WriteStreamDelegate for RecordingDelegate {
        fn on_write_open(&self) -> FirestoreResult<()> {
            let stream = self.stream.lock().unwrap().clone();
            match stream {
                Some(stream) => stream.write_handshake(),
                None => Ok(()),
            }
        }

        fn on_handshake_complete(&self) -> FirestoreResult<()> {
            *self.handshakes.lock().unwrap() += 1;
            Ok(())
        }

        fn on_mutation_result(
            &self,
            commit_version: SnapshotVersion,
            results: Vec<MutationResult>,
        ) -> FirestoreResult<()> {
            self.results.lock().unwrap().push((commit_version, results));
            Ok(())
        }

        fn on_write_close(&self, _error: FirestoreError) {}
    }

    async fn next_json(accepted: &AcceptedStream) -> JsonValue {
        serde_json::from_slice(&accepted.stream.next().await.unwrap().unwrap()).unwrap()
    }

    async fn reply(accepted: &AcceptedStream, message: JsonValue) {
        accepted
            .stream
            .send(serde_json::to_vec(&message).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handshake_then_acknowledged_writes() {
        let (client, server) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client));
        let server = MultiplexedConnection::new(server);
        let database_id = DatabaseId::default("project");
        let datastore = Arc::new(StreamingDatastoreImpl::new(connection, database_id.clone()));
        let layer = NetworkLayer::builder(datastore, Arc::new(EmptyCredentialsProvider))
            .build(AsyncQueue::new());

        let delegate = Arc::new(RecordingDelegate::default());
        let stream = Arc::new(WriteStream::new(
            &layer,
            JsonProtoSerializer::new(database_id),
            Arc::clone(&delegate),
        ));
        *delegate.stream.lock().unwrap() = Some(Arc::clone(&stream));
        stream.set_last_stream_token(vec![9]);
        stream.start();

        let accepted = server.accept_stream().await.unwrap();
        let handshake = next_json(&accepted).await;
        assert_eq!(handshake["database"], json!("projects/project/databases/(default)"));
        assert_eq!(handshake["streamToken"], json!(BASE64_STANDARD.encode([9u8])));
        assert!(stream
            .write_mutations(&[Mutation::delete(key("rooms/a"))])
            .is_err());

        reply(&accepted, json!({ "streamToken": BASE64_STANDARD.encode([1u8]) })).await;
        assert!(spin_until(|| *delegate.handshakes.lock().unwrap() == 1).await);
        assert!(stream.handshake_complete());

        let mutation = Mutation::set(key("rooms/a"), map(&[("a", FirestoreValue::from(1i64))]));
        stream.write_mutations(&[mutation]).unwrap();
        let write = next_json(&accepted).await;
        assert_eq!(write["streamToken"], json!(BASE64_STANDARD.encode([1u8])));
        assert!(write["writes"][0].get("update").is_some());

        reply(
            &accepted,
            json!({
                "streamToken": BASE64_STANDARD.encode([2u8]),
                "commitTime": "1970-01-01T00:00:04Z",
                "writeResults": [{}]
            }),
        )
        .await;
        assert!(spin_until(|| delegate.results.lock().unwrap().len() == 1).await);
        let results = delegate.results.lock().unwrap();
        assert_eq!(results[0].0, version(4));
        assert_eq!(results[0].1[0].version, version(4));
        assert_eq!(stream.last_stream_token(), vec![2]);
        drop(results);

        *delegate.stream.lock().unwrap() = None;
    }
}
