mod common;

use common::{registry, ssh_host, FakeTransport, Harness};
use futures::future::join_all;
use hostlink::ConnectOptions;
use std::time::Duration;

#[tokio::test]
async fn handshakes_never_exceed_the_global_limit() {
    let hosts = serde_json::json!({
        "h1": ssh_host("10.0.0.1"),
        "h2": ssh_host("10.0.0.2"),
        "h3": ssh_host("10.0.0.3"),
        "h4": ssh_host("10.0.0.4"),
        "h5": ssh_host("10.0.0.5"),
        "h6": ssh_host("10.0.0.6"),
    });
    let transport = FakeTransport::new(Duration::from_millis(50));
    let harness = Harness::new(
        registry(hosts, serde_json::json!({ "maxConcurrentConnections": 2 })),
        transport.clone(),
    );

    let ids = ["h1", "h2", "h3", "h4", "h5", "h6"];
    let results = join_all(
        ids.iter()
            .map(|id| harness.manager.connect(id, ConnectOptions::pooled())),
    )
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(transport.attempts(), 6);
    assert!(transport.peak_in_flight() <= 2);
    assert_eq!(transport.peak_in_flight(), 2);

    let stats = harness.manager.get_pool_stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.pool_size, 6);
    harness.manager.disconnect_all().await;
}

#[tokio::test]
async fn connects_to_one_host_are_serialized() {
    let transport = FakeTransport::new(Duration::from_millis(30));
    let harness = Harness::new(
        registry(
            serde_json::json!({ "db": ssh_host("10.0.1.1") }),
            serde_json::json!({ "maxConcurrentConnections": 5 }),
        ),
        transport.clone(),
    );

    let results = join_all(
        (0..5).map(|_| harness.manager.connect("db", ConnectOptions::bypass())),
    )
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(transport.attempts_for("db"), 5);
    assert_eq!(transport.peak_in_flight_for("db"), 1);
    for conn in results.into_iter().flatten() {
        assert!(!conn.is_pooled());
        conn.close().await;
    }
    assert!(harness.manager.pooled_hosts().is_empty());
}

#[tokio::test]
async fn concurrent_pooled_connects_share_one_handshake() {
    let transport = FakeTransport::new(Duration::from_millis(40));
    let harness = Harness::new(
        registry(
            serde_json::json!({ "app": ssh_host("10.0.2.1") }),
            serde_json::json!({}),
        ),
        transport.clone(),
    );

    let results = join_all(
        (0..4).map(|_| harness.manager.connect("app", ConnectOptions::pooled())),
    )
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(transport.attempts_for("app"), 1);
    assert_eq!(transport.sessions_for("app").len(), 1);
    assert_eq!(harness.manager.pooled_hosts(), vec!["app".to_string()]);

    harness.manager.disconnect_all().await;
    assert!(transport.sessions_for("app")[0].is_closed());
    assert!(harness.manager.pooled_hosts().is_empty());
}

#[tokio::test]
async fn unknown_and_disabled_hosts_are_config_errors() {
    let mut disabled = ssh_host("10.0.3.1");
    disabled["enabled"] = serde_json::json!(false);
    let transport = FakeTransport::new(Duration::ZERO);
    let harness = Harness::new(
        registry(serde_json::json!({ "off": disabled }), serde_json::json!({})),
        transport.clone(),
    );

    let err = harness
        .manager
        .connect("missing", ConnectOptions::pooled())
        .await
        .unwrap_err();
    assert_eq!(err.kind, hostlink::ErrorKind::Config);

    let err = harness
        .manager
        .connect("off", ConnectOptions::pooled())
        .await
        .unwrap_err();
    assert!(err.message.contains("disabled"));
    assert_eq!(transport.attempts(), 0);
}
