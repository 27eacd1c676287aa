use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catamaran::error::ClientError;
use catamaran::protocol::Consistency;
use maplit::btreeset;
use memapp::KvEvent;
use memapp::KvRequest;
use memapp::KvResponse;

use fixtures::Router;

mod fixtures;

/// Session semantics seen from a client.
///
/// What does this test do?
///
/// - registers a session, subscribes to change events, and writes a key.
/// - asserts the change event is pushed to the client in sequence.
/// - asserts queries (both consistency levels) observe the client's own
///   writes.
/// - asserts application errors surface as the command's result.
/// - closes the session and asserts the close hook fired.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_events_queries_and_close() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let router = Arc::new(Router::new(config.clone()));
    let ids = btreeset![1, 2, 3];
    router.new_cluster(&ids).await;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    let (client, mut events) = router.new_client().await;
    let session = client.register().await?;

    tracing::info!("--- subscribing and writing");
    assert_eq!(client.submit(KvRequest::Subscribe).await?, KvResponse::Done);
    assert_eq!(
        client
            .submit(KvRequest::Put {
                key: "color".into(),
                value: "teal".into(),
            })
            .await?,
        KvResponse::Done
    );

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for the change event")
        .expect("event channel closed");
    assert_eq!(event, KvEvent {
        key: "color".into(),
        value: Some("teal".into()),
    });

    tracing::info!("--- reading back through both consistency levels");
    let read = client.query(KvRequest::Get { key: "color".into() }, Consistency::Linearizable).await?;
    assert_eq!(read, KvResponse::Value(Some("teal".into())));
    let read = client.query(KvRequest::Get { key: "color".into() }, Consistency::Sequential).await?;
    assert_eq!(read, KvResponse::Value(Some("teal".into())));

    tracing::info!("--- application errors come back as results");
    let res = client
        .submit(KvRequest::Fail {
            message: "nope".into(),
        })
        .await;
    match res {
        Err(ClientError::Application(msg)) => assert!(msg.contains("nope"), "unexpected message: {}", msg),
        other => panic!("expected an application error, got {:?}", other),
    }

    // A failed command still counts against the sequence; the session must
    // keep working afterwards.
    assert_eq!(
        client
            .submit(KvRequest::Put {
                key: "color".into(),
                value: "plum".into(),
            })
            .await?,
        KvResponse::Done
    );
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for the second event")
        .expect("event channel closed");
    assert_eq!(event.value.as_deref(), Some("plum"));

    tracing::info!("--- closing the session");
    client.close().await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let state = router.state(leader).await?;
            let state = state.read().await;
            if state.closed.contains(&session) {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for the close hook");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
