use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memapp::KvRequest;
use memapp::KvResponse;

use fixtures::Router;

mod fixtures;

/// Command replay test.
///
/// What does this test do?
///
/// - a client registers a session and submits `Put k=v` with sequence 1.
/// - the leader is then partitioned away and a new leader takes over.
/// - the same command with the same sequence is resubmitted to the new
///   leader, as a reconnecting client would.
/// - asserts the result equals the original and the state machine applied
///   the write exactly once, on every node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn command_replay_applies_once() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let router = Arc::new(Router::new(config.clone()));
    let ids = btreeset![1, 2, 3];
    router.new_cluster(&ids).await;

    let first_leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;
    router.wait_for_applied(&ids, 1, Some(Duration::from_secs(2)), "no-op").await?;

    tracing::info!("--- registering a session and submitting seq 1");
    let (client, _events) = router.new_client().await;
    client.register().await?;
    let session = client.session().await.expect("session should be open");

    let put = KvRequest::Put {
        key: "k".into(),
        value: "v".into(),
    };
    let original = client.submit(put.clone()).await?;
    assert_eq!(original, KvResponse::Done);

    tracing::info!(first_leader, "--- partitioning the leader away");
    router.isolate_node(first_leader).await;
    let new_leader = loop {
        let leader = router.wait_for_leader(Duration::from_secs(5), "post-partition election").await?;
        if leader != first_leader {
            break leader;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    tracing::info!(new_leader, "--- resubmitting the same sequence to the new leader");

    let replayed = router.direct_command(new_leader, session, 1, put).await.expect("replay should succeed");
    assert_eq!(replayed.result, original, "a replayed command returns the original result");

    tracing::info!("--- healing and validating single application everywhere");
    router.restore_node(first_leader).await;

    let leader_applied = router
        .wait_for_metrics(&new_leader, |m| m.last_applied >= 3, Some(Duration::from_secs(2)), "leader applied")
        .await?
        .last_applied;
    router.wait_for_applied(&ids, leader_applied, Some(Duration::from_secs(5)), "healed catch-up").await?;

    for id in ids.iter() {
        let state = router.state(*id).await?;
        let state = state.read().await;
        assert_eq!(
            state.apply_counts.get("k"),
            Some(&1),
            "node {} applied the write {:?} times, expected exactly once",
            id,
            state.apply_counts.get("k")
        );
        assert_eq!(state.data.get("k").map(String::as_str), Some("v"));
    }
    Ok(())
}
