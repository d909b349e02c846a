use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;

use firestore_offline_sync::firestore::model::{Document, DocumentKey, MutationResult, SnapshotVersion, Timestamp};
use firestore_offline_sync::firestore::remote::{
    DocumentWatchChange, InMemoryBackend, InMemoryConnection, ListenRequest, WatchChange, WatchTargetChange,
    WatchTargetChangeState, WriteRequest, WriteResponse,
};
use firestore_offline_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_offline_sync::firestore::{
    FirestoreClient, FirestoreErrorCode, FirestoreResult, FirestoreSettings, ListenOptions, NoopTokenProvider, Query, QuerySnapshot,
    User,
};

const WAIT: Duration = Duration::from_secs(5);

fn new_client() -> (FirestoreClient, InMemoryBackend) {
    let (connection, backend) = InMemoryConnection::new();
    let settings = FirestoreSettings::default().with_cache_size_bytes(None);
    let client = FirestoreClient::new(settings, connection, Arc::new(NoopTokenProvider), User::new("alice"));
    (client, backend)
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn fields(title: &str) -> BTreeMap<String, FirestoreValue> {
    BTreeMap::from([("title".to_string(), FirestoreValue::from_string(title))])
}

fn subscriber() -> (
    impl FnMut(FirestoreResult<QuerySnapshot>) + Send + 'static,
    mpsc::UnboundedReceiver<FirestoreResult<QuerySnapshot>>,
) {
    let (tx, rx) = mpsc::unbounded();
    (move |result| {
        let _ = tx.unbounded_send(result);
    }, rx)
}

async fn next_snapshot(rx: &mut mpsc::UnboundedReceiver<FirestoreResult<QuerySnapshot>>) -> QuerySnapshot {
    tokio::time::timeout(WAIT, rx.next())
        .await
        .expect("timed out waiting for a snapshot")
        .expect("listener channel closed")
        .expect("listener failed")
}

#[tokio::test]
async fn listen_delivers_server_results_once_consistent() {
    let (client, backend) = new_client();
    let (observer, mut snapshots) = subscriber();
    let _registration = client
        .listen(Query::collection("notes").unwrap(), ListenOptions::default(), observer)
        .await
        .unwrap();

    let stream = tokio::time::timeout(WAIT, backend.next_listen_stream())
        .await
        .unwrap()
        .unwrap();
    let target_id = match stream.next_request().await {
        Some(ListenRequest::AddTarget(target)) => target.target_id,
        other => panic!("expected a target, got {other:?}"),
    };

    let key = DocumentKey::from_string("notes/first").unwrap();
    let document = Document::new_found_document(key.clone(), version(1), MapValue::new(fields("hello")));
    let messages = vec![
        WatchChange::TargetChange(WatchTargetChange::new(WatchTargetChangeState::Added, vec![target_id])),
        WatchChange::Document(DocumentWatchChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: vec![],
            key: key.clone(),
            new_document: Some(document),
        }),
        WatchChange::TargetChange(
            WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
                .with_resume_token(Bytes::from_static(b"resume-1")),
        ),
        WatchChange::TargetChange(WatchTargetChange::new(WatchTargetChangeState::NoChange, vec![]).with_read_time(version(1))),
    ];
    for message in messages {
        assert!(stream.send(message).await);
    }

    let snapshot = next_snapshot(&mut snapshots).await;
    assert!(!snapshot.metadata().from_cache());
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.documents()[0].key(), &key);
    assert_eq!(
        snapshot.documents()[0].data().and_then(|data| data.get("title")),
        Some(&FirestoreValue::from_string("hello"))
    );

    let cached = client.get_from_cache(Query::collection("notes").unwrap()).await.unwrap();
    assert_eq!(cached.len(), 1);
    client.terminate().await.unwrap();
}

#[tokio::test]
async fn offline_writes_show_up_locally_and_flush_on_reconnect() {
    let (client, backend) = new_client();
    client.disable_network().await.unwrap();

    let (observer, mut snapshots) = subscriber();
    let _registration = client
        .listen(Query::collection("notes").unwrap(), ListenOptions::default(), observer)
        .await
        .unwrap();

    let initial = next_snapshot(&mut snapshots).await;
    assert!(initial.is_empty());
    assert!(initial.metadata().from_cache());

    let write = {
        let client = client.clone();
        tokio::spawn(async move { client.set_doc("notes/draft", fields("offline"), Default::default()).await })
    };

    let local = next_snapshot(&mut snapshots).await;
    assert_eq!(local.len(), 1);
    assert!(local.metadata().from_cache());
    assert!(local.metadata().has_pending_writes());
    assert!(local.documents()[0].has_pending_writes());

    client.enable_network().await.unwrap();
    let stream = tokio::time::timeout(WAIT, backend.next_write_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.next_request().await, Some(WriteRequest::Handshake));
    assert!(
        stream
            .send(WriteResponse {
                stream_token: Bytes::from_static(b"token-0"),
                commit_version: SnapshotVersion::min(),
                write_results: vec![],
            })
            .await
    );
    match stream.next_request().await {
        Some(WriteRequest::Mutations { mutations, .. }) => assert_eq!(mutations.len(), 1),
        other => panic!("expected mutations, got {other:?}"),
    }
    assert!(
        stream
            .send(WriteResponse {
                stream_token: Bytes::from_static(b"token-1"),
                commit_version: version(5),
                write_results: vec![MutationResult::new(version(5), vec![])],
            })
            .await
    );

    tokio::time::timeout(WAIT, write).await.unwrap().unwrap().unwrap();
    client.wait_for_pending_writes().await.unwrap();

    let cached = client.get_document_from_cache("notes/draft").await.unwrap();
    assert!(cached.exists());
    assert!(!cached.has_pending_writes());
    client.terminate().await.unwrap();
}

#[tokio::test]
async fn switching_users_cancels_the_previous_users_writes() {
    let (client, _backend) = new_client();
    client.disable_network().await.unwrap();

    let write = {
        let client = client.clone();
        tokio::spawn(async move { client.set_doc("notes/private", fields("mine"), Default::default()).await })
    };
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            // Registered after the write so there is something to wait for.
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.wait_for_pending_writes().await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.switch_user(User::new("bob")).await.unwrap();

    let write_err = tokio::time::timeout(WAIT, write).await.unwrap().unwrap().unwrap_err();
    assert_eq!(write_err.code, FirestoreErrorCode::Cancelled);
    let wait_err = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap().unwrap_err();
    assert_eq!(wait_err.code_str(), "firestore/cancelled");

    // Bob's view of the cache does not include Alice's pending write.
    let cached = client.get_from_cache(Query::collection("notes").unwrap()).await.unwrap();
    assert!(cached.is_empty());
    client.terminate().await.unwrap();
}
