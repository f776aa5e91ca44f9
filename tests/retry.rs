mod common;

use common::{quiet_logger, registry, ssh_host, temp_dir, FakeTransport, Harness};
use hostlink::transport::Transport;
use hostlink::{ConnectOptions, ErrorKind, HostManager, StatusCache};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn retrying_harness(transport: Arc<FakeTransport>) -> Harness {
    Harness::new(
        registry(
            serde_json::json!({ "edge": ssh_host("192.0.2.10") }),
            serde_json::json!({ "retryAttempts": 3, "retryDelay": 100 }),
        ),
        transport,
    )
}

#[tokio::test]
async fn transient_failures_are_retried_with_delay() {
    let transport = FakeTransport::new(Duration::ZERO);
    transport.fail_first("edge", 2);
    let harness = retrying_harness(transport.clone());

    let started = Instant::now();
    let conn = harness
        .manager
        .connect("edge", ConnectOptions::pooled())
        .await
        .expect("third attempt succeeds");

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(transport.attempts_for("edge"), 3);
    assert!(conn.is_connected());

    let status = harness.manager.status_cache().get("edge").expect("status");
    assert!(status.success);
    harness.manager.disconnect_all().await;
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let transport = FakeTransport::new(Duration::ZERO);
    transport.fail_first("edge", 10);
    let harness = retrying_harness(transport.clone());

    let err = harness
        .manager
        .connect("edge", ConnectOptions::pooled())
        .await
        .unwrap_err();

    assert_eq!(transport.attempts_for("edge"), 3);
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(err.message.contains("after 3 attempt(s)"));
    assert!(err.message.contains("simulated handshake timeout"));
    assert!(err.hint.as_deref().unwrap_or("").contains("192.0.2.10"));
    assert_eq!(err.details.as_ref().unwrap()["attempts"], 3);
    assert!(harness.manager.pooled_hosts().is_empty());

    let status = harness.manager.status_cache().get("edge").expect("status");
    assert!(!status.success);
    assert!(status.error.unwrap_or_default().contains("after 3 attempt(s)"));
}

#[tokio::test]
async fn failed_connect_releases_lock_and_slot() {
    let transport = FakeTransport::new(Duration::ZERO);
    transport.fail_first("edge", 3);
    let harness = retrying_harness(transport.clone());

    assert!(harness
        .manager
        .connect("edge", ConnectOptions::pooled())
        .await
        .is_err());
    let stats = harness.manager.get_pool_stats();
    assert_eq!(stats.active_connections, 0);

    let conn = tokio::time::timeout(
        Duration::from_secs(2),
        harness.manager.connect("edge", ConnectOptions::pooled()),
    )
    .await
    .expect("lock was released")
    .expect("connects once failures are exhausted");
    assert_eq!(conn.host_id(), "edge");
    assert_eq!(transport.attempts_for("edge"), 4);
    harness.manager.disconnect_all().await;
}

#[tokio::test]
async fn overrunning_handshakes_settle_before_the_lock_moves_on() {
    // Every handshake takes 300ms against a 100ms budget.
    let transport = FakeTransport::new(Duration::from_millis(300));
    let mut edge = ssh_host("192.0.2.10");
    edge["timeout"] = serde_json::json!(100);
    let harness = Harness::new(
        registry(
            serde_json::json!({ "edge": edge }),
            serde_json::json!({ "retryAttempts": 2, "retryDelay": 0 }),
        ),
        transport.clone(),
    );

    let (first, second) = tokio::join!(
        harness.manager.connect("edge", ConnectOptions::bypass()),
        harness.manager.connect("edge", ConnectOptions::bypass()),
    );

    for result in [first, second] {
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("timed out after 100ms"));
    }
    assert_eq!(transport.attempts_for("edge"), 4);
    assert_eq!(transport.peak_in_flight_for("edge"), 1);
    let late = transport.sessions_for("edge");
    assert_eq!(late.len(), 4);
    assert!(late.iter().all(|session| session.is_closed()));
    assert_eq!(harness.manager.get_pool_stats().active_connections, 0);
}

#[tokio::test]
async fn queued_connect_gives_up_after_lock_wait() {
    let transport = FakeTransport::new(Duration::from_millis(500));
    let dir = temp_dir("lock-wait");
    let logger = quiet_logger();
    let manager = HostManager::new(
        registry(
            serde_json::json!({ "edge": ssh_host("192.0.2.10") }),
            serde_json::json!({ "retryAttempts": 1 }),
        ),
        transport.clone() as Arc<dyn Transport>,
        StatusCache::open(dir.join("status.json"), logger.clone()),
        logger,
    )
    .with_lock_wait(Duration::from_millis(50));

    let (holder, waiter) = tokio::join!(
        manager.connect("edge", ConnectOptions::bypass()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager.connect("edge", ConnectOptions::bypass()).await
        },
    );

    assert!(holder.expect("first caller connects").is_connected());
    let err = waiter.unwrap_err();
    assert_eq!(err.kind, ErrorKind::LockTimeout);
    assert!(err.retryable);
    assert_eq!(transport.attempts_for("edge"), 1);
    manager.disconnect_all().await;
    let _ = std::fs::remove_dir_all(&dir);
}
