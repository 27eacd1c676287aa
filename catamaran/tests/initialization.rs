use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catamaran::EntryPayload;
use catamaran::LogId;
use maplit::btreeset;

use fixtures::Router;

mod fixtures;

/// Cluster formation test.
///
/// What does this test do?
///
/// - brings 3 pristine nodes online, all seeded as active members.
/// - asserts exactly one becomes leader within twice the election timeout.
/// - asserts the leader's first replicated entry is the term-1 no-op at
///   index 1, and that every node commits and applies it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_initial_election() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let router = Arc::new(Router::new(config.clone()));
    let ids = btreeset![1, 2, 3];

    tracing::info!("--- bringing up a pristine 3 node cluster");
    router.new_cluster(&ids).await;

    let budget = Duration::from_millis(config.election_timeout * 2);
    let leader = router.wait_for_leader(budget, "initial election").await?;
    tracing::info!(leader, "--- leader elected");

    tracing::info!("--- waiting for the no-op to commit everywhere");
    router.wait_for_applied(&ids, 1, Some(Duration::from_secs(2)), "no-op commit").await?;
    router.assert_stable_cluster(Some(1), Some(1)).await;

    let entry = router.read_log_entry(leader, 1).await?.expect("entry 1 should exist");
    assert_eq!(entry.log_id, LogId::new(1, 1), "first entry is appended in term 1");
    assert!(
        matches!(entry.payload, EntryPayload::NoOp),
        "a new leader's first entry is a no-op"
    );

    for metrics in router.latest_metrics().await {
        assert!(
            metrics.commit_index >= 1,
            "node {} has commit_index {}, expected >= 1",
            metrics.id,
            metrics.commit_index
        );
    }
    Ok(())
}

/// A single seeded node elects itself and commits its no-op alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_becomes_leader() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let router = Arc::new(Router::new(config.clone()));
    router.new_cluster(&btreeset![1]).await;

    let budget = Duration::from_millis(config.election_timeout * 2);
    let leader = router.wait_for_leader(budget, "single node election").await?;
    assert_eq!(leader, 1);

    router.wait_for_applied(&btreeset![1], 1, Some(Duration::from_secs(2)), "no-op").await?;
    Ok(())
}
