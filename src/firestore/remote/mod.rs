pub mod backoff;
pub mod bloom_filter;
pub mod connection;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod stream;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use backoff::ExponentialBackoff;
pub use bloom_filter::BloomFilter;
pub use connection::{BidiChannel, Connection, InMemoryBackend, InMemoryConnection, ListenResponse, ServerStream};
pub use online_state_tracker::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteMessage, RemoteMessageSink, RemoteStore};
pub use remote_syncer::RemoteSyncer;
pub use watch_change::{
    BloomFilterPayload, DocumentWatchChange, ExistenceFilterChange, ListenRequest, WatchChange, WatchTarget,
    WatchTargetChange, WatchTargetChangeState, WriteRequest, WriteResponse,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
