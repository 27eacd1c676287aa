use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catamaran::EntryPayload;
use maplit::btreeset;
use memapp::KvRequest;

use fixtures::Router;

mod fixtures;

/// Two-tier log compaction test.
///
/// What does this test do?
///
/// - runs a single node cluster and submits 10 commands through it: five
///   keys, each written twice, so the first five writes are superseded once
///   the second round applies.
/// - lets the real compaction task run, with the watermarks a live cluster
///   produces and retention decided by `MemApp`'s own filter.
/// - asserts the minor pass leaves holes where the superseded half stood,
///   returns the kept half intact, and never moves the log's index range.
/// - then waits for the major pass to shed the leader's no-op while the
///   live session's register entry survives.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compaction_drops_superseded_commands() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config_with_fast_compaction();
    let router = Arc::new(Router::new(config.clone()));
    router.new_cluster(&btreeset![1]).await;
    router.wait_for_leader(Duration::from_secs(2), "single node election").await?;

    let registered = router.direct_register(1, 7).await.expect("register should succeed");
    let session = registered.session;

    tracing::info!("--- submitting 10 commands, the first five to be superseded");
    let mut sequence = 0u64;
    let mut superseded = Vec::new();
    for i in 0..5u64 {
        sequence += 1;
        let res = router
            .direct_command(1, session, sequence, KvRequest::Put {
                key: format!("k{}", i),
                value: "old".into(),
            })
            .await
            .expect("command should commit");
        superseded.push(res.index);
    }
    let mut kept = Vec::new();
    for i in 0..5u64 {
        sequence += 1;
        let res = router
            .direct_command(1, session, sequence, KvRequest::Put {
                key: format!("k{}", i),
                value: "new".into(),
            })
            .await
            .expect("command should commit");
        kept.push(res.index);
    }

    // One more write rolls the log over, sealing the segment that holds the
    // last of the ten commands.
    sequence += 1;
    router
        .direct_command(1, session, sequence, KvRequest::Put {
            key: "sealer".into(),
            value: "x".into(),
        })
        .await
        .expect("command should commit");

    let (first, last) = router.log_bounds(1).await?;
    assert_eq!(first, 1);

    tracing::info!("--- waiting for the minor pass to shed the superseded writes");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut remaining = 0usize;
        for index in superseded.iter() {
            if router.read_log_entry(1, *index).await?.is_some() {
                remaining += 1;
            }
        }
        if remaining == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for minor compaction, {} superseded entries left",
            remaining
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tracing::info!("--- validating what survived");
    for (i, index) in kept.iter().enumerate() {
        let entry = router.read_log_entry(1, *index).await?.expect("kept entry should read back");
        assert_eq!(entry.log_id.index, *index);
        match entry.payload {
            EntryPayload::Command(op) => {
                assert_eq!(op.session, session);
                match op.operation {
                    KvRequest::Put { key, value } => {
                        assert_eq!(key, format!("k{}", i));
                        assert_eq!(value, "new", "kept entries read back unchanged");
                    }
                    other => panic!("expected a put at index {}, got {:?}", index, other),
                }
            }
            other => panic!("expected a command at index {}, got {:?}", index, other),
        }
    }
    assert_eq!(
        router.log_bounds(1).await?,
        (first, last),
        "compaction never moves the log's index range"
    );

    tracing::info!("--- waiting for the major pass to shed the no-op");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while router.read_log_entry(1, 1).await?.is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for major compaction to drop the no-op"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The session is still open, so its register entry must outlive every
    // compaction tier.
    let register = router.read_log_entry(1, session).await?.expect("register should survive");
    assert!(matches!(register.payload, EntryPayload::Register(_)));

    for index in superseded.iter() {
        assert!(router.read_log_entry(1, *index).await?.is_none());
    }
    assert_eq!(
        router.log_bounds(1).await?,
        (first, last),
        "the major pass leaves the index range alone too"
    );
    Ok(())
}
