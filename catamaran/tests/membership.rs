use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catamaran::State;
use maplit::btreeset;
use memapp::KvRequest;

use fixtures::Router;

mod fixtures;

/// Membership change test.
///
/// What does this test do?
///
/// - starts a 3 node active cluster and commits some writes.
/// - brings node 4 online with a seed that does not list it, so it joins
///   through the handshake as a passive member.
/// - node 4 receives Sync entries, catches up, asks for promotion, and
///   becomes a voter; quorum grows to 3.
/// - asserts no entry is lost along the way, then removes node 4 again
///   through a graceful leave.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_sync_promote_leave() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let router = Arc::new(Router::new(config.clone()));
    let ids = btreeset![1, 2, 3];
    router.new_cluster(&ids).await;

    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;
    router.wait_for_applied(&ids, 1, Some(Duration::from_secs(2)), "no-op").await?;

    tracing::info!("--- committing some writes before the join");
    let (client, _events) = router.new_client().await;
    client.register().await?;
    for i in 0..5u64 {
        client
            .submit(KvRequest::Put {
                key: format!("k{}", i),
                value: format!("v{}", i),
            })
            .await?;
    }

    tracing::info!("--- node 4 joins through the handshake");
    router.new_server(4, &ids).await;

    // Joins as passive, catches up over Sync, then promotes to active.
    router
        .wait_for_metrics(
            &4,
            |m| m.state == State::Follower && m.membership.is_active(&4),
            Some(Duration::from_secs(10)),
            "node 4 promoted to active",
        )
        .await?;

    let metrics = router.server(leader).await?.metrics().borrow().clone();
    assert_eq!(metrics.membership.active.len(), 4);
    assert_eq!(metrics.membership.quorum(), 3, "quorum grows with the fourth voter");

    tracing::info!("--- validating nothing was lost");
    let applied = metrics.last_applied;
    let all = btreeset![1, 2, 3, 4];
    router.wait_for_applied(&all, applied, Some(Duration::from_secs(5)), "full catch-up").await?;

    let joined_state = router.state(4).await?;
    let joined_state = joined_state.read().await;
    for i in 0..5u64 {
        assert_eq!(
            joined_state.data.get(&format!("k{}", i)).map(String::as_str),
            Some(format!("v{}", i).as_str()),
            "node 4 is missing k{}",
            i
        );
    }
    drop(joined_state);

    tracing::info!("--- node 4 leaves gracefully");
    router.server(4).await?.leave_cluster().await.expect("leave should complete");
    router
        .wait_for_metrics(
            &leader,
            |m| !m.membership.contains(&4),
            Some(Duration::from_secs(5)),
            "node 4 removed",
        )
        .await?;
    let metrics = router.server(leader).await?.metrics().borrow().clone();
    assert_eq!(metrics.membership.active.len(), 3);
    assert_eq!(metrics.membership.quorum(), 2);
    Ok(())
}
