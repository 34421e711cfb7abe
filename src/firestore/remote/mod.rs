pub mod bloom_filter;
pub mod datastore;
pub mod network;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterParams};
pub use datastore::{
    CredentialChangeListener, CredentialsProvider, CredentialsProviderArc, EmptyCredentialsProvider,
    StaticCredentialsProvider, StreamHandle, StreamingDatastore, StreamingDatastoreImpl, Token,
};
pub use network::{NetworkLayer, NetworkLayerBuilder, RetrySettings};
pub use online_state_tracker::OnlineStateTracker;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use rpc_error::map_grpc_status;
pub use serializer::JsonProtoSerializer;
pub use stream::{
    AcceptedStream, InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamMetadata,
    StreamTransport,
};
pub use watch_change::{WatchChange, WatchTargetChange};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
