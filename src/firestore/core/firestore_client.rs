use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::firestore::constants::{
    DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS, HEALTHY_STREAM_PERIOD, ONLINE_STATE_TIMEOUT,
};
use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, ListenerId, QueryListener, QueryObserver,
};
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::{Query, View, ViewSnapshot};
use crate::firestore::error::{cancelled, internal_error, unavailable, FirestoreResult};
use crate::firestore::local::{LocalStore, Persistence};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, Mutation};
use crate::firestore::remote::{
    CredentialChangeListener, CredentialsProviderArc, JsonProtoSerializer, NetworkLayer,
    RemoteStore, RemoteSyncer, RetrySettings, StreamingDatastore,
};
use crate::firestore::util::AsyncQueue;
use crate::util::backoff::BackoffConfig;

/// Tuning knobs of a [`FirestoreClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClientSettings {
    /// Documents resolved through their own listen target at the same time.
    pub max_concurrent_limbo_resolutions: usize,
    /// How long the first listen may take before the client reports itself
    /// offline.
    pub online_state_timeout: Duration,
    pub stream_retry: RetrySettings,
    pub healthy_stream_period: Duration,
    /// Backoff between attempts of an operation that hit a transient
    /// storage failure.
    pub storage_retry: BackoffConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            online_state_timeout: ONLINE_STATE_TIMEOUT,
            stream_retry: RetrySettings::streaming_defaults(),
            healthy_stream_period: HEALTHY_STREAM_PERIOD,
            storage_retry: BackoffConfig::default(),
        }
    }
}

impl ClientSettings {
    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_stream_retry(mut self, retry: RetrySettings) -> Self {
        self.stream_retry = retry;
        self
    }

    pub fn with_healthy_stream_period(mut self, period: Duration) -> Self {
        self.healthy_stream_period = period;
        self
    }

    pub fn with_storage_retry(mut self, retry: BackoffConfig) -> Self {
        self.storage_retry = retry;
        self
    }
}

/// Offline-first client of one database.
///
/// Every operation is serialized on a single [`AsyncQueue`]. Reads are
/// served from the local cache with pending writes applied; writes are
/// visible immediately and sent to the backend once it is reachable.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    database_id: DatabaseId,
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    next_listener_id: AtomicU64,
    terminated: async_lock::Mutex<bool>,
}

impl FirestoreClient {
    /// Wires up the client and connects to the backend.
    pub async fn new(
        database_id: DatabaseId,
        persistence: Arc<dyn Persistence>,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: CredentialsProviderArc,
        settings: ClientSettings,
    ) -> FirestoreResult<Self> {
        let queue = AsyncQueue::with_retry_backoff(settings.storage_retry);
        let layer = NetworkLayer::builder(datastore, Arc::clone(&credentials))
            .with_retry(settings.stream_retry.clone())
            .with_healthy_period(settings.healthy_stream_period)
            .build(queue.clone());

        let local_store = Arc::new(LocalStore::new(persistence));
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            &layer,
            JsonProtoSerializer::new(database_id.clone()),
            settings.online_state_timeout,
        );
        let sync_engine = Arc::new(SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            settings.max_concurrent_limbo_resolutions,
        ));
        let event_manager = Arc::new(EventManager::new(Arc::clone(&sync_engine)));

        let syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&sync_engine) as Weak<dyn RemoteSyncer>;
        remote_store.set_syncer(syncer);
        let listener: Weak<dyn SyncEngineListener> =
            Arc::downgrade(&event_manager) as Weak<dyn SyncEngineListener>;
        sync_engine.set_listener(listener);

        let engine = Arc::downgrade(&sync_engine);
        let on_change: CredentialChangeListener = Arc::new(move |_token| {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if let Err(err) = engine.handle_credential_change() {
                log::warn!("failed to restart streams after credential change: {err}");
            }
        });
        credentials.start(queue.clone(), on_change);

        let start_store = remote_store.clone();
        queue.enqueue(async move { start_store.start() }).await?;
        log::debug!("FirestoreClient started for {}", database_id.project_id());

        Ok(Self {
            inner: Arc::new(ClientInner {
                database_id,
                queue,
                local_store,
                remote_store,
                sync_engine,
                event_manager,
                next_listener_id: AtomicU64::new(1),
                terminated: async_lock::Mutex::new(false),
            }),
        })
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    /// Starts listening to `query`. The observer gets a snapshot whenever the
    /// result changes, and at most one error, after which the listener is
    /// gone. Dropping the registration stops the listener.
    pub fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: QueryObserver,
    ) -> ListenerRegistration {
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let muted = Arc::new(AtomicBool::new(false));
        let observer = observer.muted_by(Arc::clone(&muted));

        let event_manager = Arc::clone(&self.inner.event_manager);
        let listen_query = query.clone();
        let removed = Arc::clone(&muted);
        self.inner.queue.enqueue_retryable(move || {
            let event_manager = Arc::clone(&event_manager);
            let removed = Arc::clone(&removed);
            let observer = observer.clone();
            let listener =
                QueryListener::new(listener_id, listen_query.clone(), options, observer.clone());
            async move {
                if removed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                match event_manager.listen(listener) {
                    Err(err) if err.is_transient_storage_error() => Err(err),
                    Err(err) => {
                        observer.error(err);
                        Ok(())
                    }
                    Ok(()) => Ok(()),
                }
            }
        });

        ListenerRegistration {
            queue: self.inner.queue.clone(),
            event_manager: Arc::downgrade(&self.inner.event_manager),
            query,
            listener_id,
            muted,
        }
    }

    /// Applies `mutations` as one atomic batch. Resolves once the backend
    /// commits the batch, and fails if it rejects it. Local reads see the
    /// batch right away.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let engine = Arc::clone(&self.inner.sync_engine);
        let completion = self
            .inner
            .queue
            .enqueue_retryable_and_wait(move || {
                let engine = Arc::clone(&engine);
                let mutations = mutations.clone();
                async move { engine.write(mutations) }
            })
            .await?;
        completion
            .await
            .unwrap_or_else(|_| Err(cancelled("The write was dropped before it completed")))
    }

    /// Reads `key` from the cache with pending writes applied. `None` when
    /// the document is known not to exist.
    pub async fn get_document_from_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        let local_store = Arc::clone(&self.inner.local_store);
        let document = self
            .inner
            .queue
            .enqueue_retryable_and_wait(move || {
                let local_store = Arc::clone(&local_store);
                let key = key.clone();
                async move { local_store.read_document(&key) }
            })
            .await?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(format!(
                "Failed to get document {} from cache. The client is offline and has not seen it yet.",
                document.key()
            )))
        }
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue_retryable_and_wait(move || {
                let local_store = Arc::clone(&local_store);
                let query = query.clone();
                async move {
                    let result = local_store.execute_query(&query, true)?;
                    let mut view = View::new(query, result.remote_keys);
                    let changes = view.compute_doc_changes(&result.documents, None);
                    view.apply_changes(changes, false, None)
                        .snapshot
                        .ok_or_else(|| internal_error("a cache query raised no snapshot"))
                }
            })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.enable_network() })
            .await
    }

    /// Goes offline. Listeners keep getting snapshots from the cache and
    /// writes stay queued until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                remote_store.disable_network();
                Ok(())
            })
            .await
    }

    /// Shuts the client down. Writes still waiting for the backend fail with
    /// `cancelled` and stay in the durable mutation queue. Every later call
    /// fails with `cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        let mut terminated = self.inner.terminated.lock().await;
        if *terminated {
            return Ok(());
        }
        let remote_store = self.inner.remote_store.clone();
        let local_store = Arc::clone(&self.inner.local_store);
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move {
                remote_store.shutdown();
                sync_engine.cancel_pending_writes();
                local_store.shutdown();
                Ok(())
            })
            .await?;
        self.inner.queue.shutdown().await;
        *terminated = true;
        log::debug!("FirestoreClient terminated");
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_shut_down()
    }
}

/// Handle of a listener started with [`FirestoreClient::listen`].
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
    query: Query,
    listener_id: ListenerId,
    muted: Arc<AtomicBool>,
}

impl ListenerRegistration {
    /// Stops the listener. Nothing is delivered after this returns.
    pub fn remove(&self) {
        if self.muted.swap(true, Ordering::SeqCst) {
            return;
        }
        let event_manager = self.event_manager.clone();
        let query = self.query.clone();
        let listener_id = self.listener_id;
        self.queue.enqueue_and_forget(async move {
            match event_manager.upgrade() {
                Some(event_manager) => event_manager.unlisten(&query, listener_id),
                None => Ok(()),
            }
        });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}
