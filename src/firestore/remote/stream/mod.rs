//! The listen and write streams.
//!
//! A [`PersistentStream`] is driven from the client's queue: every transport event
//! comes back as a [`StreamEvent`] tagged with the generation of the connection that
//! produced it, so events from a connection that has since been closed are dropped.

mod persistent;

use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::connection::{BidiChannel, Connection, ListenResponse};
use crate::firestore::remote::watch_change::{ListenRequest, WriteRequest, WriteResponse};

pub use persistent::{PersistentStream, StreamNotification, StreamState};

/// Something that happened to a stream, delivered back to the queue.
#[derive(Debug)]
pub enum StreamEvent<Resp> {
    Open,
    Message(Resp),
    /// The backend ended the connection or it could not be opened.
    Closed(FirestoreError),
    BackoffElapsed,
    IdleElapsed(u64),
}

/// Callback posting stream events, with their generation, onto the client's queue.
pub type StreamEventSink<Resp> = Arc<dyn Fn(u64, StreamEvent<Resp>) + Send + Sync>;

/// How a particular stream kind is opened.
#[async_trait]
pub trait StreamProtocol: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    const LABEL: &'static str;

    async fn open(
        connection: Arc<dyn Connection>,
        database_id: DatabaseId,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<Self::Request, Self::Response>>;
}

pub struct ListenProtocol;

#[async_trait]
impl StreamProtocol for ListenProtocol {
    type Request = ListenRequest;
    type Response = ListenResponse;

    const LABEL: &'static str = "listen";

    async fn open(
        connection: Arc<dyn Connection>,
        database_id: DatabaseId,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<ListenRequest, ListenResponse>> {
        connection
            .open_listen_stream(&database_id, auth_token)
            .await
    }
}

pub struct WriteProtocol;

#[async_trait]
impl StreamProtocol for WriteProtocol {
    type Request = WriteRequest;
    type Response = WriteResponse;

    const LABEL: &'static str = "write";

    async fn open(
        connection: Arc<dyn Connection>,
        database_id: DatabaseId,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<WriteRequest, WriteResponse>> {
        connection
            .open_write_stream(&database_id, auth_token)
            .await
    }
}

pub type ListenStream = PersistentStream<ListenProtocol>;
pub type WriteStream = PersistentStream<WriteProtocol>;
