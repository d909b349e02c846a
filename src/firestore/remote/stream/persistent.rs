use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::firestore::credentials::TokenProviderArc;
use crate::firestore::error::{unavailable, FirestoreError, FirestoreErrorCode};
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::backoff::ExponentialBackoff;
use crate::firestore::remote::connection::{BidiChannel, Connection};
use crate::firestore::remote::stream::{StreamEvent, StreamEventSink, StreamProtocol};
use crate::firestore::settings::RemoteSettings;
use crate::platform::runtime::{self, until_cancelled};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Never started, stopped, or closed after being idle. `start` connects at once.
    Initial,
    /// Fetching a token and opening the connection.
    Starting,
    Open,
    /// The last connection failed. `start` backs off before reconnecting.
    Error,
    /// Waiting out a backoff delay before reconnecting.
    Backoff,
    /// Shut down for good; `start` does nothing.
    Closed,
}

/// What the owner of a stream has to react to after [`PersistentStream::handle_event`].
#[derive(Debug)]
pub enum StreamNotification<Resp> {
    Opened,
    Message(Resp),
    /// The stream closed; `None` when it was closed for being idle.
    Closed(Option<FirestoreError>),
}

/// A reconnecting stream whose state lives on the client's queue.
///
/// The connection itself runs on a spawned task that posts [`StreamEvent`]s through
/// the sink. Each close bumps the generation, so events still in flight from an
/// older connection are ignored by [`handle_event`](Self::handle_event).
pub struct PersistentStream<P: StreamProtocol> {
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
    database_id: DatabaseId,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    sink: StreamEventSink<P::Response>,
    state: StreamState,
    generation: u64,
    offline: bool,
    outbound: Option<Sender<P::Request>>,
    connection_task: Option<CancellationToken>,
    backoff_timer: Option<CancellationToken>,
    idle_timer: Option<(u64, CancellationToken)>,
    next_idle_id: u64,
}

impl<P: StreamProtocol> PersistentStream<P> {
    pub fn new(
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        database_id: DatabaseId,
        settings: &RemoteSettings,
        sink: StreamEventSink<P::Response>,
    ) -> Self {
        Self {
            connection,
            token_provider,
            database_id,
            backoff: ExponentialBackoff::new(settings),
            idle_timeout: settings.idle_timeout,
            sink,
            state: StreamState::Initial,
            generation: 0,
            offline: false,
            outbound: None,
            connection_task: None,
            backoff_timer: None,
            idle_timer: None,
            next_idle_id: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Starting, open, or waiting to reconnect.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// While offline, reconnect attempts use the short fixed retry delay.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn start(&mut self) {
        match self.state {
            StreamState::Error => self.perform_backoff(),
            StreamState::Initial => self.open_connection(),
            StreamState::Closed => log::debug!("firestore: {} stream is closed, not restarting", P::LABEL),
            _ => log::debug!("firestore: {} stream already started", P::LABEL),
        }
    }

    /// Closes the stream without reporting an error; the next `start` connects at once.
    pub fn stop(&mut self) {
        if self.is_started() {
            self.close(StreamState::Initial, None);
        }
    }

    /// Closes the stream permanently, cancelling any pending reconnect.
    pub fn terminate(&mut self) {
        if self.state != StreamState::Closed {
            self.close(StreamState::Closed, None);
        }
    }

    /// Lets the next `start` after a failure reconnect without waiting.
    pub fn inhibit_backoff(&mut self) {
        if self.state == StreamState::Error {
            self.state = StreamState::Initial;
            self.backoff.reset();
        }
    }

    pub fn send(&mut self, request: P::Request) {
        self.cancel_idle_timer();
        match &self.outbound {
            Some(outbound) if outbound.try_send(request).is_ok() => {}
            _ => log::debug!("firestore: dropped request on closed {} stream", P::LABEL),
        }
    }

    /// Closes the stream after the idle timeout unless it is used again first.
    pub fn mark_idle(&mut self) {
        if !self.is_open() || self.idle_timer.is_some() {
            return;
        }
        self.next_idle_id += 1;
        let id = self.next_idle_id;
        let token = CancellationToken::new();
        self.schedule(self.idle_timeout, token.clone(), StreamEvent::IdleElapsed(id));
        self.idle_timer = Some((id, token));
    }

    pub fn handle_event(
        &mut self,
        generation: u64,
        event: StreamEvent<P::Response>,
    ) -> Option<StreamNotification<P::Response>> {
        if generation != self.generation {
            log::trace!("firestore: ignoring stale {} stream event", P::LABEL);
            return None;
        }
        match event {
            StreamEvent::Open => {
                if self.state != StreamState::Starting {
                    return None;
                }
                log::debug!("firestore: {} stream open", P::LABEL);
                self.state = StreamState::Open;
                Some(StreamNotification::Opened)
            }
            StreamEvent::Message(response) => {
                if self.state != StreamState::Open {
                    return None;
                }
                self.backoff.reset();
                Some(StreamNotification::Message(response))
            }
            StreamEvent::Closed(error) => {
                if !self.is_started() {
                    return None;
                }
                log::debug!("firestore: {} stream closed: {error}", P::LABEL);
                self.close(StreamState::Error, Some(&error));
                Some(StreamNotification::Closed(Some(error)))
            }
            StreamEvent::BackoffElapsed => {
                if self.state != StreamState::Backoff {
                    return None;
                }
                self.backoff_timer = None;
                self.open_connection();
                None
            }
            StreamEvent::IdleElapsed(id) => {
                let current = self
                    .idle_timer
                    .as_ref()
                    .is_some_and(|(timer_id, _)| *timer_id == id);
                if !current || !self.is_open() {
                    return None;
                }
                log::debug!("firestore: closing idle {} stream", P::LABEL);
                self.close(StreamState::Initial, None);
                Some(StreamNotification::Closed(None))
            }
        }
    }

    fn open_connection(&mut self) {
        self.state = StreamState::Starting;
        let (request_tx, request_rx) = async_channel::unbounded();
        self.outbound = Some(request_tx);
        let cancel = CancellationToken::new();
        self.connection_task = Some(cancel.clone());

        let task = ConnectionTask::<P> {
            connection: Arc::clone(&self.connection),
            token_provider: Arc::clone(&self.token_provider),
            database_id: self.database_id.clone(),
            requests: request_rx,
            sink: Arc::clone(&self.sink),
            generation: self.generation,
            cancel,
        };
        runtime::spawn_detached(task.run());
    }

    fn perform_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay(self.offline);
        log::debug!("firestore: {} stream reconnecting in {delay:?}", P::LABEL);
        let token = CancellationToken::new();
        self.schedule(delay, token.clone(), StreamEvent::BackoffElapsed);
        self.backoff_timer = Some(token);
    }

    fn close(&mut self, final_state: StreamState, error: Option<&FirestoreError>) {
        self.cancel_idle_timer();
        if let Some(timer) = self.backoff_timer.take() {
            timer.cancel();
        }
        if let Some(task) = self.connection_task.take() {
            task.cancel();
        }
        // Dropping the sender half-closes the connection.
        self.outbound = None;
        self.generation += 1;

        if final_state != StreamState::Error {
            self.backoff.reset();
        } else if let Some(error) = error {
            match error.code {
                FirestoreErrorCode::ResourceExhausted => {
                    log::debug!("firestore: {} stream exhausted its quota, using max backoff", P::LABEL);
                    self.backoff.reset_to_max();
                }
                FirestoreErrorCode::Unauthenticated => self.token_provider.invalidate_token(),
                _ => {}
            }
        }
        self.state = final_state;
    }

    fn cancel_idle_timer(&mut self) {
        if let Some((_, timer)) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    fn schedule(&self, delay: Duration, token: CancellationToken, event: StreamEvent<P::Response>) {
        let sink = Arc::clone(&self.sink);
        let generation = self.generation;
        runtime::spawn_detached(async move {
            if until_cancelled(&token, runtime::sleep(delay)).await.is_some() {
                sink(generation, event);
            }
        });
    }
}

impl<P: StreamProtocol> Drop for PersistentStream<P> {
    fn drop(&mut self) {
        self.cancel_idle_timer();
        for token in [self.backoff_timer.take(), self.connection_task.take()]
            .into_iter()
            .flatten()
        {
            token.cancel();
        }
    }
}

struct ConnectionTask<P: StreamProtocol> {
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
    database_id: DatabaseId,
    requests: Receiver<P::Request>,
    sink: StreamEventSink<P::Response>,
    generation: u64,
    cancel: CancellationToken,
}

impl<P: StreamProtocol> ConnectionTask<P> {
    async fn run(self) {
        let ConnectionTask {
            connection,
            token_provider,
            database_id,
            requests,
            sink,
            generation,
            cancel,
        } = self;

        let opening = async move {
            let token = token_provider.get_token().await?;
            P::open(connection, database_id, token).await
        };
        let BidiChannel { outbound, inbound } = match until_cancelled(&cancel, opening).await {
            None => return,
            Some(Ok(channel)) => channel,
            Some(Err(err)) => {
                sink(generation, StreamEvent::Closed(err));
                return;
            }
        };

        runtime::spawn_detached(forward_requests(requests, outbound));
        sink(generation, StreamEvent::Open);

        loop {
            match until_cancelled(&cancel, inbound.recv()).await {
                None => return,
                Some(Ok(Ok(response))) => sink(generation, StreamEvent::Message(response)),
                Some(Ok(Err(err))) => {
                    sink(generation, StreamEvent::Closed(err));
                    return;
                }
                Some(Err(_)) => {
                    let err = unavailable(format!("{} stream closed by the backend", P::LABEL));
                    sink(generation, StreamEvent::Closed(err));
                    return;
                }
            }
        }
    }
}

/// Copies queued requests onto the connection until the stream is closed.
async fn forward_requests<Req>(requests: Receiver<Req>, outbound: Sender<Req>) {
    while let Ok(request) = requests.recv().await {
        if outbound.send(request).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::credentials::NoopTokenProvider;
    use crate::firestore::error::resource_exhausted;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::remote::connection::InMemoryConnection;
    use crate::firestore::remote::stream::WriteStream;
    use crate::firestore::remote::watch_change::{WriteRequest, WriteResponse};
    use bytes::Bytes;

    type Events = Receiver<(u64, StreamEvent<WriteResponse>)>;

    fn fast_settings() -> RemoteSettings {
        RemoteSettings {
            initial_backoff_delay: Duration::from_millis(5),
            max_backoff_delay: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(10),
            ..RemoteSettings::default()
        }
    }

    fn write_stream(connection: Arc<InMemoryConnection>) -> (WriteStream, Events) {
        let (tx, rx) = async_channel::unbounded();
        let sink: StreamEventSink<WriteResponse> = Arc::new(move |generation, event| {
            let _ = tx.try_send((generation, event));
        });
        let stream = WriteStream::new(
            connection,
            Arc::new(NoopTokenProvider),
            DatabaseId::default_for("demo"),
            &fast_settings(),
            sink,
        );
        (stream, rx)
    }

    async fn next(stream: &mut WriteStream, events: &Events) -> Option<StreamNotification<WriteResponse>> {
        let (generation, event) = events.recv().await.unwrap();
        stream.handle_event(generation, event)
    }

    fn empty_response() -> WriteResponse {
        WriteResponse {
            stream_token: Bytes::from_static(b"token"),
            commit_version: SnapshotVersion::min(),
            write_results: vec![],
        }
    }

    #[tokio::test]
    async fn delivers_messages_then_backs_off_after_failure() {
        let (connection, backend) = InMemoryConnection::new();
        let (mut stream, events) = write_stream(connection);

        stream.start();
        assert_eq!(stream.state(), StreamState::Starting);
        let server = backend.next_write_stream().await.unwrap();
        assert!(matches!(next(&mut stream, &events).await, Some(StreamNotification::Opened)));

        stream.send(WriteRequest::Handshake);
        assert_eq!(server.next_request().await, Some(WriteRequest::Handshake));
        assert!(server.send(empty_response()).await);
        match next(&mut stream, &events).await {
            Some(StreamNotification::Message(response)) => assert_eq!(response, empty_response()),
            other => panic!("unexpected notification {other:?}"),
        }

        server.fail(unavailable("connection reset")).await;
        match next(&mut stream, &events).await {
            Some(StreamNotification::Closed(Some(err))) => {
                assert_eq!(err.code, FirestoreErrorCode::Unavailable)
            }
            other => panic!("unexpected notification {other:?}"),
        }
        assert_eq!(stream.state(), StreamState::Error);

        stream.start();
        assert_eq!(stream.state(), StreamState::Backoff);
        assert!(next(&mut stream, &events).await.is_none());
        assert_eq!(stream.state(), StreamState::Starting);
        assert!(backend.next_write_stream().await.is_some());
    }

    #[tokio::test]
    async fn idle_stream_closes_cleanly() {
        let (connection, backend) = InMemoryConnection::new();
        let (mut stream, events) = write_stream(connection);
        stream.start();
        let _server = backend.next_write_stream().await.unwrap();
        assert!(matches!(next(&mut stream, &events).await, Some(StreamNotification::Opened)));

        stream.mark_idle();
        assert!(matches!(next(&mut stream, &events).await, Some(StreamNotification::Closed(None))));
        assert_eq!(stream.state(), StreamState::Initial);
    }

    #[tokio::test]
    async fn terminated_stream_cannot_be_restarted() {
        let (connection, backend) = InMemoryConnection::new();
        let (mut stream, events) = write_stream(connection);
        stream.start();
        let server = backend.next_write_stream().await.unwrap();
        let (generation, event) = events.recv().await.unwrap();

        stream.terminate();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.is_started());
        assert!(stream.handle_event(generation, event).is_none());
        assert_eq!(server.next_request().await, None);

        stream.start();
        stream.inhibit_backoff();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn events_from_a_stopped_connection_are_ignored() {
        let (connection, backend) = InMemoryConnection::new();
        let (mut stream, events) = write_stream(connection);
        stream.start();
        let server = backend.next_write_stream().await.unwrap();
        let (generation, event) = events.recv().await.unwrap();

        stream.stop();
        assert!(stream.handle_event(generation, event).is_none());
        assert_eq!(stream.state(), StreamState::Initial);
        assert_eq!(server.next_request().await, None);
    }

    #[tokio::test]
    async fn exhausted_backend_waits_the_maximum_delay() {
        let (connection, backend) = InMemoryConnection::new();
        let (mut stream, events) = write_stream(connection);
        stream.start();
        let server = backend.next_write_stream().await.unwrap();
        assert!(matches!(next(&mut stream, &events).await, Some(StreamNotification::Opened)));

        server.fail(resource_exhausted("quota")).await;
        assert!(matches!(next(&mut stream, &events).await, Some(StreamNotification::Closed(Some(_)))));
        assert_eq!(stream.backoff.current_base(), Duration::from_millis(50));
    }
}
