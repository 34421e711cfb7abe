use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub mod persistent;

pub use persistent::{PersistentStream, PersistentStreamDelegate, StreamKind, StreamState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Describes the RPC a stream is opened for. Travels with the open frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub route: String,
    pub headers: BTreeMap<String, String>,
}

impl StreamMetadata {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamMetadata),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, metadata: StreamMetadata) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(metadata),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Bidirectional frame pipe shared by every stream of a connection.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Multiplexes logical streams over one transport. One side opens streams,
/// the peer receives them through [`MultiplexedConnection::accept_stream`].
pub struct MultiplexedConnection {
    transport: Arc<dyn StreamTransport>,
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted_rx: Receiver<AcceptedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            transport: Arc::clone(&transport),
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams: Arc::clone(&streams),
            accepted_rx,
        };

        manager.start_outbound_loop(outbound_rx);
        manager.start_inbound_loop(streams, accepted_tx);
        manager
    }

    fn start_outbound_loop(&self, outbound_rx: Receiver<TransportFrame>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err:?}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(&self, streams: StreamRegistry, accepted_tx: Sender<AcceptedStream>) {
        let transport = Arc::clone(&self.transport);
        let handle = self.clone_handle();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err:?}");
                        let orphaned: Vec<_> = streams.lock().unwrap().drain().collect();
                        for (_, sender) in orphaned {
                            let _ = sender
                                .send(FrameKind::Error(unavailable("Connection lost")))
                                .await;
                        }
                        break;
                    }
                };

                let stream_id = frame.stream_id();
                let maybe_sender = streams.lock().unwrap().get(&stream_id).cloned();
                match (maybe_sender, frame.kind) {
                    (None, FrameKind::Open(metadata)) => {
                        let (inbound_tx, inbound_rx) = async_channel::unbounded();
                        streams.lock().unwrap().insert(stream_id, inbound_tx);
                        let stream = MultiplexedStream {
                            id: stream_id,
                            outbound: handle.outbound_tx.clone(),
                            inbound: inbound_rx,
                            manager: handle.clone(),
                        };
                        if accepted_tx
                            .send(AcceptedStream { metadata, stream })
                            .await
                            .is_err()
                        {
                            log::debug!("no acceptor for stream {}", stream_id.value());
                        }
                    }
                    (None, _) => {
                        log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    }
                    (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                        let _ = sender.send(event).await;
                        streams.lock().unwrap().remove(&stream_id);
                    }
                    (Some(sender), event) => {
                        if let Err(err) = sender.send(event).await {
                            log::debug!(
                                "dropping inbound frame for closed stream {}: {:?}",
                                stream_id.value(),
                                err
                            );
                        }
                    }
                }
            }
        });
    }

    pub async fn open_stream(&self, metadata: StreamMetadata) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        {
            let mut guard = self.streams.lock().unwrap();
            guard.insert(stream_id, inbound_tx);
        }
        self.outbound_tx
            .send(TransportFrame::open(stream_id, metadata))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            manager: self.clone_handle(),
        })
    }

    /// Waits for the peer to open a stream. Returns `None` once the
    /// connection is gone.
    pub async fn accept_stream(&self) -> Option<AcceptedStream> {
        self.accepted_rx.recv().await.ok()
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

/// A stream opened by the peer, with the metadata it was opened with.
pub struct AcceptedStream {
    pub metadata: StreamMetadata,
    pub stream: MultiplexedStream,
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
}

impl MultiplexedConnectionHandle {
    pub fn close_stream(&self, stream_id: StreamId) {
        let registered = self.streams.lock().unwrap().remove(&stream_id).is_some();
        if registered {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    /// Terminates the stream on the peer's side with `error`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.manager.streams.lock().unwrap().remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }

    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.manager.streams.lock().unwrap().remove(&self.id);
        self.outbound
            .send(TransportFrame::close(self.id))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue close frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| internal_error(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| internal_error(format!("loopback transport recv failed: {err}")))
    }
}
