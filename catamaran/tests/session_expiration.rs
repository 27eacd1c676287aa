use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catamaran::error::ClientError;
use catamaran::Config;
use maplit::btreeset;
use memapp::KvRequest;

use fixtures::Router;

mod fixtures;

/// Session expiration test.
///
/// What does this test do?
///
/// - registers a session and never renews it.
/// - drives the log clock past the session timeout with a later entry.
/// - asserts the session expires exactly once, the state machine's expiry
///   hook fires exactly once, and further commands on the session fail
///   with `SessionExpired`.
///
/// Expiry is measured purely against entry timestamps (the log clock), so
/// the second registration is what pushes the first session over the edge.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_expires_by_log_clock() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("session-ut".into())
            .election_timeout(200)
            .heartbeat_interval(40)
            .session_timeout(400)
            .probe_delay(20)
            .validate()?,
    );
    let router = Arc::new(Router::new(config.clone()));
    router.new_cluster(&btreeset![1]).await;
    router.wait_for_leader(Duration::from_secs(2), "single node election").await?;

    tracing::info!("--- registering a session that will never keep alive");
    let stale = router.direct_register(1, 77).await.expect("register should succeed");

    // Nothing in the log moves time forward yet, so the session stays open
    // well past its timeout in wall-clock terms.
    tokio::time::sleep(Duration::from_millis(600)).await;
    {
        let state = router.state(1).await?;
        let state = state.read().await;
        assert!(state.expired.is_empty(), "no entry applied, so no expiry yet");
    }

    tracing::info!("--- driving the log clock forward");
    let fresh = router.direct_register(1, 78).await.expect("register should succeed");
    assert_ne!(stale.session, fresh.session);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let state = router.state(1).await?;
            let state = state.read().await;
            if !state.expired.is_empty() {
                assert_eq!(state.expired, vec![stale.session], "exactly the stale session expires");
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for expiry");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The hook fired exactly once and the session is gone for good.
    let res = router
        .direct_command(1, stale.session, 1, KvRequest::Put {
            key: "k".into(),
            value: "v".into(),
        })
        .await;
    assert!(
        matches!(res, Err(ClientError::SessionExpired(id)) if id == stale.session),
        "commands on an expired session fail with SessionExpired, got {:?}",
        res
    );

    let state = router.state(1).await?;
    let state = state.read().await;
    assert_eq!(state.expired.len(), 1, "the expiry hook fires exactly once");
    assert_eq!(state.registered, vec![stale.session, fresh.session]);
    Ok(())
}
