use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memapp::KvRequest;

use fixtures::Router;

mod fixtures;

/// Minority partition test.
///
/// What does this test do?
///
/// - partitions the leader away from a 3 node cluster.
/// - asserts the isolated node never inflates its term (the pre-vote round
///   fails without a quorum).
/// - asserts the majority elects a fresh leader and keeps committing.
/// - heals the partition and asserts the returning node catches up and
///   matches the log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_partition_heals() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let router = Arc::new(Router::new(config.clone()));
    let ids = btreeset![1, 2, 3];
    router.new_cluster(&ids).await;

    let old_leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;
    router.wait_for_applied(&ids, 1, Some(Duration::from_secs(2)), "no-op").await?;
    let isolated_term = router.server(old_leader).await?.metrics().borrow().current_term;

    tracing::info!(old_leader, "--- partitioning {{leader}} from the rest");
    router.isolate_node(old_leader).await;

    let new_leader = loop {
        let leader = router.wait_for_leader(Duration::from_secs(5), "majority re-election").await?;
        if leader != old_leader {
            break leader;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let majority: std::collections::BTreeSet<u64> = ids.iter().copied().filter(|id| *id != old_leader).collect();

    tracing::info!(new_leader, "--- committing commands on the majority side");
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

    let applied = router.server(new_leader).await?.metrics().borrow().last_applied;
    router.wait_for_applied(&majority, applied, Some(Duration::from_secs(2)), "majority commit").await?;

    // Give the minority node ample time to try (and fail) to campaign.
    tokio::time::sleep(Duration::from_millis(config.election_timeout * 3)).await;
    let minority_term = router.server(old_leader).await?.metrics().borrow().current_term;
    assert_eq!(
        minority_term, isolated_term,
        "an isolated node must not inflate its term while partitioned"
    );

    tracing::info!("--- healing the partition");
    router.restore_node(old_leader).await;
    router.wait_for_applied(&ids, applied, Some(Duration::from_secs(5)), "catch-up after heal").await?;

    // Stop the client's keep-alive traffic so the applied indexes settle,
    // then check the cluster converged.
    client.close().await?;
    let applied = router.server(new_leader).await?.metrics().borrow().last_applied;
    router.wait_for_applied(&ids, applied, Some(Duration::from_secs(5)), "settle after close").await?;
    router.assert_stable_cluster(None, None).await;

    // The healed node's log matches the leader's entry for entry.
    for index in 1..=applied {
        let healed = router.read_log_entry(old_leader, index).await?;
        let leader_entry = router.read_log_entry(new_leader, index).await?;
        assert_eq!(
            healed, leader_entry,
            "logs diverge at index {} after healing",
            index
        );
    }
    Ok(())
}
