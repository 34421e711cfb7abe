use std::sync::Arc;

use futures::FutureExt;

use super::{StreamHandle, StreamingDatastore, StreamingFuture, Token};
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamMetadata};

pub const LISTEN_ROUTE: &str = "google.firestore.v1.Firestore/Listen";
pub const WRITE_ROUTE: &str = "google.firestore.v1.Firestore/Write";
pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";
pub const AUTHORIZATION_HEADER: &str = "authorization";

pub fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Opens listen and write streams as logical streams of one multiplexed
/// connection.
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
    database_id: DatabaseId,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>, database_id: DatabaseId) -> Self {
        Self {
            connection,
            database_id,
        }
    }

    fn metadata(&self, route: &str, token: Option<Token>) -> StreamMetadata {
        let metadata = StreamMetadata::new(route)
            .with_header(RESOURCE_PREFIX_HEADER, self.database_id.canonical_name());
        match token {
            Some(token) => metadata.with_header(AUTHORIZATION_HEADER, token.authorization_header()),
            None => metadata,
        }
    }

    fn open(&self, metadata: StreamMetadata) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let stream = connection.open_stream(metadata).await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_listen_stream(
        &self,
        token: Option<Token>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(self.metadata(LISTEN_ROUTE, token))
    }

    fn open_write_stream(
        &self,
        token: Option<Token>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(self.metadata(WRITE_ROUTE, token))
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}
