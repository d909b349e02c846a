//! Transport seam for the two long-lived streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{unavailable, FirestoreError, FirestoreResult};
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::watch_change::{ListenRequest, WatchChange, WriteRequest, WriteResponse};

/// Messages on the listen stream; global consistency points are `NoChange` target
/// changes carrying a read time.
pub type ListenResponse = WatchChange;

/// Client half of an open bidirectional stream.
///
/// Dropping `outbound` half-closes the stream; the server ends it by closing
/// `inbound` or by sending an error.
pub struct BidiChannel<Req, Resp> {
    pub outbound: Sender<Req>,
    pub inbound: Receiver<FirestoreResult<Resp>>,
}

/// Opens streams to the backend.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_listen_stream(
        &self,
        database_id: &DatabaseId,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<ListenRequest, ListenResponse>>;

    async fn open_write_stream(
        &self,
        database_id: &DatabaseId,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<WriteRequest, WriteResponse>>;
}

/// Server half of an in-memory stream.
pub struct ServerStream<Req, Resp> {
    pub auth_token: Option<String>,
    requests: Receiver<Req>,
    responses: Sender<FirestoreResult<Resp>>,
}

impl<Req, Resp> ServerStream<Req, Resp> {
    /// Next request from the client, or `None` once the client closed the stream.
    pub async fn next_request(&self) -> Option<Req> {
        self.requests.recv().await.ok()
    }

    pub fn try_next_request(&self) -> Option<Req> {
        self.requests.try_recv().ok()
    }

    /// Returns false if the client has gone away.
    pub async fn send(&self, response: Resp) -> bool {
        self.responses.send(Ok(response)).await.is_ok()
    }

    /// Fails the stream with `error` and closes it.
    pub async fn fail(&self, error: FirestoreError) {
        let _ = self.responses.send(Err(error)).await;
        self.responses.close();
    }

    pub fn close(&self) {
        self.responses.close();
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.requests.is_closed() && self.requests.is_empty()
    }
}

/// A [`Connection`] whose server side is driven by an [`InMemoryBackend`].
pub struct InMemoryConnection {
    available: Arc<AtomicBool>,
    listen_streams: Sender<ServerStream<ListenRequest, ListenResponse>>,
    write_streams: Sender<ServerStream<WriteRequest, WriteResponse>>,
}

/// Test-side handle that accepts the streams an [`InMemoryConnection`] opens.
pub struct InMemoryBackend {
    available: Arc<AtomicBool>,
    listen_streams: Receiver<ServerStream<ListenRequest, ListenResponse>>,
    write_streams: Receiver<ServerStream<WriteRequest, WriteResponse>>,
}

impl InMemoryConnection {
    pub fn new() -> (Arc<Self>, InMemoryBackend) {
        let available = Arc::new(AtomicBool::new(true));
        let (listen_tx, listen_rx) = async_channel::unbounded();
        let (write_tx, write_rx) = async_channel::unbounded();
        let connection = Arc::new(Self {
            available: Arc::clone(&available),
            listen_streams: listen_tx,
            write_streams: write_tx,
        });
        let backend = InMemoryBackend {
            available,
            listen_streams: listen_rx,
            write_streams: write_rx,
        };
        (connection, backend)
    }

    async fn open<Req, Resp>(
        &self,
        streams: &Sender<ServerStream<Req, Resp>>,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<Req, Resp>>
    where
        Req: Send,
        Resp: Send,
    {
        if !self.available.load(Ordering::SeqCst) {
            return Err(unavailable("backend is unreachable"));
        }
        let (request_tx, request_rx) = async_channel::unbounded();
        let (response_tx, response_rx) = async_channel::unbounded();
        streams
            .send(ServerStream {
                auth_token,
                requests: request_rx,
                responses: response_tx,
            })
            .await
            .map_err(|_| unavailable("backend has shut down"))?;
        Ok(BidiChannel {
            outbound: request_tx,
            inbound: response_rx,
        })
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_listen_stream(
        &self,
        _database_id: &DatabaseId,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<ListenRequest, ListenResponse>> {
        self.open(&self.listen_streams, auth_token).await
    }

    async fn open_write_stream(
        &self,
        _database_id: &DatabaseId,
        auth_token: Option<String>,
    ) -> FirestoreResult<BidiChannel<WriteRequest, WriteResponse>> {
        self.open(&self.write_streams, auth_token).await
    }
}

impl InMemoryBackend {
    /// While unavailable, opening a stream fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn next_listen_stream(&self) -> Option<ServerStream<ListenRequest, ListenResponse>> {
        self.listen_streams.recv().await.ok()
    }

    pub async fn next_write_stream(&self) -> Option<ServerStream<WriteRequest, WriteResponse>> {
        self.write_streams.recv().await.ok()
    }

    pub fn pending_listen_streams(&self) -> usize {
        self.listen_streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::SnapshotVersion;
    use bytes::Bytes;

    #[tokio::test]
    async fn streams_carry_requests_and_responses() {
        let (connection, backend) = InMemoryConnection::new();
        let database = DatabaseId::default_for("demo");
        let client = connection
            .open_write_stream(&database, Some("token".into()))
            .await
            .unwrap();
        let server = backend.next_write_stream().await.unwrap();
        assert_eq!(server.auth_token.as_deref(), Some("token"));

        client.outbound.send(WriteRequest::Handshake).await.unwrap();
        assert_eq!(server.next_request().await, Some(WriteRequest::Handshake));

        let response = WriteResponse {
            stream_token: Bytes::from_static(b"t"),
            commit_version: SnapshotVersion::min(),
            write_results: vec![],
        };
        assert!(server.send(response.clone()).await);
        assert_eq!(client.inbound.recv().await.unwrap().unwrap(), response);

        drop(client);
        assert_eq!(server.next_request().await, None);
    }

    #[tokio::test]
    async fn unavailable_backend_refuses_streams() {
        let (connection, backend) = InMemoryConnection::new();
        backend.set_available(false);
        let err = match connection
            .open_listen_stream(&DatabaseId::default_for("demo"), None)
            .await
        {
            Ok(_) => panic!("stream should not open"),
            Err(err) => err,
        };
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }
}
