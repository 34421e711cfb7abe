use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::firestore::error::{
    failed_precondition, internal_error, unavailable, FirestoreError, FirestoreErrorCode,
    FirestoreResult,
};
use crate::firestore::remote::datastore::{CredentialsProviderArc, StreamHandle, StreamingDatastore};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }

    fn backoff_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }

    fn healthy_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamHealthy,
            StreamKind::Write => TimerId::WriteStreamHealthy,
        }
    }
}

/// Lifecycle of a [`PersistentStream`].
///
/// `Initial → Starting → Open → (Error → Backoff → Starting)*`, with
/// `Stopped` reachable from every state through [`PersistentStream::stop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Starting,
    Open,
    Error,
    Backoff,
    Stopped,
}

/// Receives stream events. Every callback runs on the stream's queue.
pub trait PersistentStreamDelegate: Send + Sync + 'static {
    fn on_stream_open(&self) -> FirestoreResult<()>;

    /// An error returned here closes the stream with that error.
    fn on_stream_message(&self, message: Vec<u8>) -> FirestoreResult<()>;

    /// The stream failed and is now in [`StreamState::Error`]. Calling
    /// [`PersistentStream::start`] reconnects after the backoff delay.
    fn on_stream_close(&self, error: FirestoreError);
}

/// A reconnecting RPC stream.
///
/// Opening, message delivery and failures are funnelled through the
/// [`AsyncQueue`]; the owner decides whether to restart after a failure.
/// Every open attempt gets a new generation so events of an abandoned
/// connection are ignored.
pub struct PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    shared: Arc<StreamShared<D>>,
}

impl<D> Clone for PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct StreamShared<D> {
    kind: StreamKind,
    queue: AsyncQueue,
    datastore: Arc<dyn StreamingDatastore>,
    credentials: CredentialsProviderArc,
    healthy_period: Duration,
    delegate: Arc<D>,
    control: Mutex<StreamControl>,
}

struct StreamControl {
    state: StreamState,
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    outbound: Option<Sender<Vec<u8>>>,
    backoff: ExponentialBackoff,
    backoff_timer: Option<DelayedOperation>,
    healthy_timer: Option<DelayedOperation>,
    auth_retried: bool,
}

impl StreamControl {
    fn tear_down(&mut self) {
        if let Some(timer) = self.healthy_timer.take() {
            timer.cancel();
        }
        self.generation += 1;
        self.outbound = None;
        if let Some(handle) = self.handle.take() {
            close_handle(handle);
        }
    }
}

impl<D> PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    pub fn new(layer: &NetworkLayer, kind: StreamKind, delegate: Arc<D>) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                kind,
                queue: layer.queue().clone(),
                datastore: layer.datastore(),
                credentials: layer.credentials(),
                healthy_period: layer.healthy_period(),
                delegate,
                control: Mutex::new(StreamControl {
                    state: StreamState::Initial,
                    generation: 0,
                    handle: None,
                    outbound: None,
                    backoff: ExponentialBackoff::new(layer.retry().backoff_config()),
                    backoff_timer: None,
                    healthy_timer: None,
                    auth_retried: false,
                }),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn state(&self) -> StreamState {
        self.shared.control.lock().unwrap().state
    }

    /// True from `start` until the stream is stopped or fails.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Opens the stream. After a failure the attempt is delayed by the
    /// backoff; an already started stream is left alone.
    pub fn start(&self) {
        let mut control = self.shared.control.lock().unwrap();
        match control.state {
            StreamState::Error => {
                control.state = StreamState::Backoff;
                let delay = control.backoff.next_delay();
                let generation = control.generation;
                log::debug!(
                    "{} stream reconnecting in {delay:?}",
                    self.shared.kind.label()
                );
                let stream = self.clone();
                let timer = self.shared.queue.enqueue_after_delay(
                    self.shared.kind.backoff_timer(),
                    delay,
                    async move {
                        stream.open_after_backoff(generation);
                        Ok(())
                    },
                );
                control.backoff_timer = Some(timer);
            }
            StreamState::Initial | StreamState::Stopped => self.open(&mut control),
            StreamState::Starting | StreamState::Open | StreamState::Backoff => {}
        }
    }

    /// Closes the stream without notifying the delegate.
    pub fn stop(&self) {
        let mut control = self.shared.control.lock().unwrap();
        if let Some(timer) = control.backoff_timer.take() {
            timer.cancel();
        }
        control.tear_down();
        control.state = StreamState::Stopped;
        control.backoff.reset();
        control.auth_retried = false;
    }

    /// Makes the next `start` after a failure connect without delay.
    pub fn inhibit_backoff(&self) {
        let mut control = self.shared.control.lock().unwrap();
        if control.state == StreamState::Error {
            control.state = StreamState::Initial;
        }
        control.backoff.reset();
    }

    /// Queues `payload` for the open connection.
    pub fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let control = self.shared.control.lock().unwrap();
        match (control.state, &control.outbound) {
            (StreamState::Open, Some(outbound)) => outbound.try_send(payload).map_err(|err| {
                internal_error(format!(
                    "Failed to queue {} stream message: {err}",
                    self.shared.kind.label()
                ))
            }),
            _ => Err(failed_precondition(format!(
                "The {} stream is not open",
                self.shared.kind.label()
            ))),
        }
    }

    fn open_after_backoff(&self, generation: u64) {
        let mut control = self.shared.control.lock().unwrap();
        if control.state != StreamState::Backoff || control.generation != generation {
            return;
        }
        control.backoff_timer = None;
        self.open(&mut control);
    }

    fn open(&self, control: &mut StreamControl) {
        control.state = StreamState::Starting;
        control.generation += 1;
        let generation = control.generation;

        let stream = self.clone();
        runtime::spawn_detached(async move {
            let result = stream.connect().await;
            let queue = stream.shared.queue.clone();
            queue.enqueue_and_forget(async move {
                stream.on_open_result(generation, result);
                Ok(())
            });
        });
    }

    async fn connect(&self) -> FirestoreResult<Arc<dyn StreamHandle>> {
        // Fetched on every attempt so a refreshed token is picked up.
        let token = self.shared.credentials.get_token(false).await?;
        match self.shared.kind {
            StreamKind::Listen => self.shared.datastore.open_listen_stream(token).await,
            StreamKind::Write => self.shared.datastore.open_write_stream(token).await,
        }
    }

    fn on_open_result(&self, generation: u64, result: FirestoreResult<Arc<dyn StreamHandle>>) {
        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                self.close_with_error(generation, err);
                return;
            }
        };

        {
            let mut control = self.shared.control.lock().unwrap();
            if control.generation != generation || control.state != StreamState::Starting {
                close_handle(handle);
                return;
            }
            control.state = StreamState::Open;
            let (outbound, pending) = async_channel::unbounded();
            control.outbound = Some(outbound);
            control.handle = Some(Arc::clone(&handle));

            let stream = self.clone();
            control.healthy_timer = Some(self.shared.queue.enqueue_after_delay(
                self.shared.kind.healthy_timer(),
                self.shared.healthy_period,
                async move {
                    stream.mark_healthy(generation);
                    Ok(())
                },
            ));

            self.spawn_writer(Arc::clone(&handle), pending);
            self.spawn_reader(handle, generation);
        }

        log::debug!("{} stream open", self.shared.kind.label());
        if let Err(err) = self.shared.delegate.on_stream_open() {
            self.close_with_error(generation, err);
        }
    }

    fn spawn_writer(&self, handle: Arc<dyn StreamHandle>, pending: Receiver<Vec<u8>>) {
        let label = self.shared.kind.label();
        runtime::spawn_detached(async move {
            while let Ok(payload) = pending.recv().await {
                if let Err(err) = handle.send(payload).await {
                    log::debug!("{label} stream send failed: {err}");
                    break;
                }
            }
        });
    }

    fn spawn_reader(&self, handle: Arc<dyn StreamHandle>, generation: u64) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            loop {
                let event = handle.next().await;
                let finished = !matches!(event, Some(Ok(_)));
                let target = stream.clone();
                stream.shared.queue.enqueue_and_forget(async move {
                    target.on_stream_event(generation, event);
                    Ok(())
                });
                if finished {
                    break;
                }
            }
        });
    }

    fn on_stream_event(&self, generation: u64, event: Option<FirestoreResult<Vec<u8>>>) {
        match event {
            Some(Ok(payload)) => self.on_message(generation, payload),
            Some(Err(err)) => self.close_with_error(generation, err),
            None => self.close_with_error(
                generation,
                unavailable(format!(
                    "The {} stream was closed by the backend",
                    self.shared.kind.label()
                )),
            ),
        }
    }

    fn on_message(&self, generation: u64, payload: Vec<u8>) {
        {
            let mut control = self.shared.control.lock().unwrap();
            if control.generation != generation || control.state != StreamState::Open {
                return;
            }
            control.backoff.reset();
            control.auth_retried = false;
        }

        if let Err(err) = self.shared.delegate.on_stream_message(payload) {
            log::warn!(
                "{} stream failed to handle message: {err}",
                self.shared.kind.label()
            );
            self.close_with_error(generation, err);
        }
    }

    fn mark_healthy(&self, generation: u64) {
        let mut control = self.shared.control.lock().unwrap();
        if control.generation == generation && control.state == StreamState::Open {
            control.healthy_timer = None;
            control.backoff.reset();
        }
    }

    fn close_with_error(&self, generation: u64, error: FirestoreError) {
        let invalidate = {
            let mut control = self.shared.control.lock().unwrap();
            if control.generation != generation
                || !matches!(control.state, StreamState::Starting | StreamState::Open)
            {
                return;
            }
            control.tear_down();
            control.state = StreamState::Error;

            match error.code {
                FirestoreErrorCode::Unauthenticated => {
                    // One immediate retry with a fresh token; a second
                    // consecutive rejection goes through the backoff.
                    if !control.auth_retried {
                        control.auth_retried = true;
                        control.backoff.reset();
                        if let Some(timer) = control.backoff_timer.take() {
                            timer.cancel();
                        }
                    }
                    true
                }
                FirestoreErrorCode::ResourceExhausted => {
                    control.backoff.reset_to_max();
                    false
                }
                _ => false,
            }
        };

        if invalidate {
            self.shared.credentials.invalidate_token();
        }
        log::debug!(
            "{} stream closed with error: {error}",
            self.shared.kind.label()
        );
        self.shared.delegate.on_stream_close(error);
    }
}

fn close_handle(handle: Arc<dyn StreamHandle>) {
    runtime::spawn_detached(async move {
        if let Err(err) = handle.close().await {
            log::debug!("failed to close stream: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated, unavailable};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::datastore::{StaticCredentialsProvider, StreamingDatastoreImpl, Token};
    use crate::firestore::remote::network::RetrySettings;
    use crate::firestore::remote::stream::{
        AcceptedStream, InMemoryTransport, MultiplexedConnection,
    };
    use crate::firestore::test_support::spin_until;

    #[derive(Default)]
    struct RecordingDelegate {
        opened: Mutex<usize>,
        messages: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<FirestoreErrorCode>>,
    }

    impl PersistentStreamDelegate for RecordingDelegate {
        fn on_stream_open(&self) -> FirestoreResult<()> {
            *self.opened.lock().unwrap() += 1;
            Ok(())
        }

        fn on_stream_message(&self, message: Vec<u8>) -> FirestoreResult<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        fn on_stream_close(&self, error: FirestoreError) {
            self.errors.lock().unwrap().push(error.code);
        }
    }

    struct Fixture {
        server: MultiplexedConnection,
        credentials: Arc<StaticCredentialsProvider>,
        queue: AsyncQueue,
        delegate: Arc<RecordingDelegate>,
        stream: PersistentStream<RecordingDelegate>,
    }

    fn fixture() -> Fixture {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client_transport));
        let server = MultiplexedConnection::new(server_transport);
        let datastore = Arc::new(StreamingDatastoreImpl::new(
            connection,
            DatabaseId::default("project"),
        ));
        let credentials = Arc::new(StaticCredentialsProvider::new(Some(Token::new("t"))));
        let queue = AsyncQueue::new();
        let layer = NetworkLayer::builder(datastore, credentials.clone())
            .with_retry(RetrySettings {
                initial_delay: Duration::from_secs(30),
                multiplier: 1.5,
                max_delay: Duration::from_secs(60),
            })
            .build(queue.clone());
        let delegate = Arc::new(RecordingDelegate::default());
        let stream = PersistentStream::new(&layer, StreamKind::Listen, Arc::clone(&delegate));
        Fixture {
            server,
            credentials,
            queue,
            delegate,
            stream,
        }
    }

    async fn accept(fixture: &Fixture) -> AcceptedStream {
        let accepted = fixture.server.accept_stream().await.expect("accepted stream");
        let stream = fixture.stream.clone();
        assert!(spin_until(|| stream.is_open()).await);
        accepted
    }

    async fn fail(fixture: &Fixture, accepted: AcceptedStream, error: FirestoreError, count: usize) {
        accepted.stream.fail(error).await.unwrap();
        let delegate = Arc::clone(&fixture.delegate);
        assert!(spin_until(|| delegate.errors.lock().unwrap().len() == count).await);
        assert_eq!(fixture.stream.state(), StreamState::Error);
    }

    #[tokio::test]
    async fn delivers_messages_and_sends_payloads() {
        let fixture = fixture();
        fixture.stream.start();
        let accepted = accept(&fixture).await;
        assert_eq!(*fixture.delegate.opened.lock().unwrap(), 1);

        fixture.stream.send(b"ping".to_vec()).unwrap();
        let received = accepted.stream.next().await.unwrap().unwrap();
        assert_eq!(received, b"ping");

        accepted.stream.send(b"pong".to_vec()).await.unwrap();
        let delegate = Arc::clone(&fixture.delegate);
        assert!(spin_until(|| delegate.messages.lock().unwrap().len() == 1).await);

        fixture.stream.stop();
        assert_eq!(fixture.stream.state(), StreamState::Stopped);
        assert!(fixture.stream.send(b"late".to_vec()).is_err());
        assert!(accepted.stream.next().await.is_none());
        assert!(fixture.delegate.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_restarts_immediately_once() {
        let fixture = fixture();
        fixture.stream.start();
        let accepted = accept(&fixture).await;

        // Advances the backoff past its zero first step.
        fail(&fixture, accepted, unavailable("gone"), 1).await;
        fixture.stream.start();
        let accepted = accept(&fixture).await;

        fail(&fixture, accepted, unauthenticated("expired"), 2).await;
        assert_eq!(fixture.credentials.invalidation_count(), 1);
        fixture.stream.start();
        let accepted = accept(&fixture).await;

        fail(&fixture, accepted, unauthenticated("expired"), 3).await;
        assert_eq!(fixture.credentials.invalidation_count(), 2);
        fixture.stream.start();
        assert_eq!(fixture.stream.state(), StreamState::Backoff);
        assert!(fixture
            .queue
            .contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
    }

    #[tokio::test]
    async fn resource_exhausted_waits_for_maximum_backoff() {
        let fixture = fixture();
        fixture.stream.start();
        let accepted = accept(&fixture).await;

        fail(&fixture, accepted, resource_exhausted("quota"), 1).await;
        fixture.stream.start();
        assert_eq!(fixture.stream.state(), StreamState::Backoff);
        assert!(fixture
            .queue
            .contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));

        fixture
            .queue
            .run_delayed_operations_early(Some(TimerId::ListenStreamConnectionBackoff));
        let _accepted = accept(&fixture).await;
        assert_eq!(*fixture.delegate.opened.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_events_are_ignored_after_stop() {
        let fixture = fixture();
        fixture.stream.start();
        let accepted = accept(&fixture).await;

        fixture.stream.stop();
        let _ = accepted.stream.send(b"late".to_vec()).await;
        runtime::sleep(Duration::from_millis(20)).await;
        assert!(fixture.delegate.messages.lock().unwrap().is_empty());
        assert!(fixture.delegate.errors.lock().unwrap().is_empty());
    }
}
