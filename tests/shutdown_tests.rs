//! Shutdown tests: idempotent deactivation, bounded retries, claim
//! release, and interaction with a pending reconnect.


use std::time::Duration;

use serde_json::json;
use slotclaim::error::ShutdownError;
use slotclaim::manager::RunOutcome;
use slotclaim::record::{attr, MemoryJobRecord};
use slotclaim::remote::AuditEvent;
use slotclaim::{ClaimConfig, ResourceState};
use test_harness::{spawn_claim, spawn_claim_with, wait_for_state};

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_is_idempotent() {
    let rig = spawn_claim(ClaimConfig::default());
    rig.handle.activate().await.expect("activation should succeed");

    rig.handle
        .request_shutdown(true)
        .await
        .expect("shutdown should succeed");
    rig.handle
        .request_shutdown(true)
        .await
        .expect("repeated shutdown should be a no-op");

    assert_eq!(rig.peer.deactivate_calls(), 1, "kill is delivered once");
    assert_eq!(rig.state().await, ResourceState::PendingDeath);
    assert_eq!(
        rig.audit
            .count(|e| matches!(e, AuditEvent::ShutdownRequested { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_retries_are_bounded() {
    let mut config = ClaimConfig::default();
    config.shutdown_max_retries = 3;
    config.shutdown_retry_delay = Duration::from_secs(2);
    let rig = spawn_claim(config);
    rig.handle.activate().await.expect("activation should succeed");
    rig.peer.script(|s| {
        for _ in 0..3 {
            s.deactivate_script.push_back(false);
        }
    });

    let err = rig
        .handle
        .request_shutdown(true)
        .await
        .expect_err("shutdown should give up");

    assert_eq!(err, ShutdownError::PeerUnreachable(3));
    assert_eq!(rig.peer.deactivate_calls(), 3);
    // An undelivered kill leaves the claim where it was.
    assert_eq!(rig.state().await, ResourceState::Startup);
}

#[tokio::test(start_paused = true)]
async fn test_wait_on_shutdown_keeps_retrying_within_the_lease() {
    let mut config = ClaimConfig::default().with_lease(Duration::from_secs(60));
    config.wait_on_shutdown = true;
    config.shutdown_max_retries = 2;
    config.shutdown_retry_delay = Duration::from_secs(2);
    let rig = spawn_claim(config);
    rig.handle.activate().await.expect("activation should succeed");
    rig.peer.script(|s| {
        for _ in 0..5 {
            s.deactivate_script.push_back(false);
        }
    });

    rig.handle
        .request_shutdown(true)
        .await
        .expect("the kill is eventually delivered");

    // Two bounded attempts, then lease-funded retries until the sixth
    // call goes through.
    assert_eq!(rig.peer.deactivate_calls(), 6);
    assert_eq!(rig.state().await, ResourceState::PendingDeath);
}

#[tokio::test(start_paused = true)]
async fn test_wait_on_shutdown_gives_up_when_the_lease_runs_out() {
    let mut config = ClaimConfig::default().with_lease(Duration::from_secs(10));
    config.wait_on_shutdown = true;
    config.shutdown_max_retries = 2;
    config.shutdown_retry_delay = Duration::from_secs(2);
    let rig = spawn_claim(config);
    rig.handle.activate().await.expect("activation should succeed");
    rig.peer.script(|s| {
        for _ in 0..10 {
            s.deactivate_script.push_back(false);
        }
    });

    let err = rig
        .handle
        .request_shutdown(true)
        .await
        .expect_err("the wait ends with the lease");

    // Attempts every 2s starting at t0 stop at the t+10s lease deadline.
    assert_eq!(err, ShutdownError::PeerUnreachable(6));
    assert_eq!(rig.peer.deactivate_calls(), 6);
    // An undelivered kill leaves the claim where it was.
    assert_eq!(rig.state().await, ResourceState::Startup);
}

#[tokio::test(start_paused = true)]
async fn test_release_is_requested_after_deactivation() {
    let record = MemoryJobRecord::new().with_attr(attr::RELEASE_CLAIM, json!(true));
    let rig = spawn_claim_with(ClaimConfig::default(), record);
    rig.handle.activate().await.expect("activation should succeed");

    rig.handle
        .request_shutdown(true)
        .await
        .expect("shutdown should succeed");

    // The kill is already delivered, so the release always asks for a
    // fast vacate, even after a graceful kill.
    assert_eq!(rig.peer.release_calls(), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn test_release_is_not_requested_without_the_attribute() {
    let rig = spawn_claim(ClaimConfig::default());
    rig.handle.activate().await.expect("activation should succeed");

    rig.handle
        .request_shutdown(false)
        .await
        .expect("shutdown should succeed");

    assert!(rig.peer.release_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_a_pending_reconnect() {
    let config = ClaimConfig::default()
        .with_lease(Duration::from_secs(3600))
        .with_backoff(|_| Duration::from_secs(50));
    let rig = spawn_claim(config);
    rig.handle.activate().await.expect("activation should succeed");

    rig.handle.socket_lost().await;
    wait_for_state(&rig.handle, ResourceState::Reconnecting).await;
    let attempts_before = rig.peer.locate_calls();

    rig.handle
        .request_shutdown(false)
        .await
        .expect("shutdown should succeed");
    assert_eq!(rig.state().await, ResourceState::PendingDeath);

    // The scheduled attempt must never fire once the claim is dying.
    tokio::time::advance(Duration::from_secs(200)).await;
    // Round-trip through the manager so any stray timer would have fired.
    assert_eq!(rig.state().await, ResourceState::PendingDeath);
    assert_eq!(rig.peer.locate_calls(), attempts_before);

    rig.cancel.cancel();
    let outcome = rig.task.await.expect("manager task should not panic");
    assert_eq!(outcome, RunOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_invalidates_sessions() {
    let rig = spawn_claim(ClaimConfig::default());
    rig.handle.activate().await.expect("activation should succeed");

    rig.cancel.cancel();
    let outcome = rig.task.await.expect("manager task should not panic");
    assert_eq!(outcome, RunOutcome::Cancelled);

    let invalidated = rig.sessions.invalidated();
    assert_eq!(invalidated.len(), 2);
    let negotiated = rig.sessions.negotiated();
    assert!(invalidated.contains(&negotiated[0].id().to_string()));
    assert!(invalidated.contains(&negotiated[1].id().to_string()));
}
