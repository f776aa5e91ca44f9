mod common;

use common::{registry, ssh_host, FakeTransport, Harness};
use hostlink::{ConnectOptions, ErrorKind};
use std::time::Duration;

#[tokio::test]
async fn full_pool_evicts_the_oldest_connection() {
    let transport = FakeTransport::new(Duration::ZERO);
    let harness = Harness::new(
        registry(
            serde_json::json!({
                "a": ssh_host("10.2.0.1"),
                "b": ssh_host("10.2.0.2"),
                "c": ssh_host("10.2.0.3"),
            }),
            serde_json::json!({ "connectionPoolSize": 2 }),
        ),
        transport.clone(),
    );

    for id in ["a", "b", "c"] {
        harness
            .manager
            .connect(id, ConnectOptions::pooled())
            .await
            .expect("connect");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        harness.manager.pooled_hosts(),
        vec!["b".to_string(), "c".to_string()]
    );
    assert!(transport.sessions_for("a")[0].is_closed());
    assert!(!transport.sessions_for("b")[0].is_closed());

    let stats = harness.manager.get_pool_stats();
    assert_eq!(stats.pool_size, 2);
    assert_eq!(stats.max_pool_size, 2);

    // The evicted host reconnects with a fresh handshake.
    harness
        .manager
        .connect("a", ConnectOptions::pooled())
        .await
        .expect("reconnect");
    assert_eq!(transport.attempts_for("a"), 2);
    assert_eq!(
        harness.manager.pooled_hosts(),
        vec!["a".to_string(), "c".to_string()]
    );
    harness.manager.disconnect_all().await;
}

#[tokio::test]
async fn disconnect_closes_the_pooled_connection() {
    let transport = FakeTransport::new(Duration::ZERO);
    let harness = Harness::new(
        registry(
            serde_json::json!({ "a": ssh_host("10.2.1.1") }),
            serde_json::json!({}),
        ),
        transport.clone(),
    );

    let conn = harness
        .manager
        .connect("a", ConnectOptions::pooled())
        .await
        .expect("connect");
    assert!(conn.is_pooled());
    assert!(harness.manager.disconnect("a").await);
    assert!(!conn.is_connected());
    assert!(!harness.manager.disconnect("a").await);
}

#[tokio::test]
async fn jump_host_tunnels_the_target_handshake() {
    let mut inner = ssh_host("10.2.2.2");
    inner["jumpHost"] = serde_json::json!("bastion");
    let transport = FakeTransport::new(Duration::ZERO);
    let harness = Harness::new(
        registry(
            serde_json::json!({
                "bastion": ssh_host("203.0.113.1"),
                "inner": inner,
            }),
            serde_json::json!({}),
        ),
        transport.clone(),
    );

    let output = harness
        .manager
        .execute("inner", "hostname", Default::default())
        .await
        .expect("exec through jump host");
    assert_eq!(output.stdout, "ran: hostname\n");

    let bastion = &transport.sessions_for("bastion")[0];
    assert_eq!(bastion.forwards(), vec!["10.2.2.2:22".to_string()]);
    let target = &transport.sessions_for("inner")[0];
    assert_eq!(target.via_tunnel.as_deref(), Some("10.2.2.2:22"));
    assert_eq!(target.commands(), vec!["hostname".to_string()]);

    // The jump hop is pooled; the one-shot target connection is not.
    assert_eq!(harness.manager.pooled_hosts(), vec!["bastion".to_string()]);
    assert!(target.is_closed());
    harness.manager.disconnect_all().await;
}

#[tokio::test]
async fn jump_cycles_are_rejected_before_any_handshake() {
    let mut a = ssh_host("10.2.3.1");
    a["jumpHost"] = serde_json::json!("b");
    let mut b = ssh_host("10.2.3.2");
    b["jumpHost"] = serde_json::json!("a");
    let transport = FakeTransport::new(Duration::ZERO);
    let harness = Harness::new(
        registry(serde_json::json!({ "a": a, "b": b }), serde_json::json!({})),
        transport.clone(),
    );

    let err = harness
        .manager
        .connect("a", ConnectOptions::pooled())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
    assert!(err.message.contains("a -> b -> a"));
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn local_jump_host_means_a_direct_connection() {
    let mut target = ssh_host("10.2.4.1");
    target["jumpHost"] = serde_json::json!("here");
    let transport = FakeTransport::new(Duration::ZERO);
    let harness = Harness::new(
        registry(
            serde_json::json!({
                "here": { "type": "local" },
                "target": target,
            }),
            serde_json::json!({}),
        ),
        transport.clone(),
    );

    harness
        .manager
        .connect("target", ConnectOptions::pooled())
        .await
        .expect("connect");
    assert_eq!(transport.sessions_for("target")[0].via_tunnel, None);
    assert_eq!(harness.manager.pooled_hosts(), vec!["target".to_string()]);
    harness.manager.disconnect_all().await;
}

#[tokio::test]
async fn single_slot_pool_keeps_the_hop_of_its_only_entry_open() {
    let mut inner = ssh_host("10.2.5.2");
    inner["jumpHost"] = serde_json::json!("bastion");
    let transport = FakeTransport::new(Duration::ZERO);
    let harness = Harness::new(
        registry(
            serde_json::json!({
                "bastion": ssh_host("203.0.113.5"),
                "inner": inner,
                "other": ssh_host("10.2.5.3"),
            }),
            serde_json::json!({ "connectionPoolSize": 1 }),
        ),
        transport.clone(),
    );

    let conn = harness
        .manager
        .connect("inner", ConnectOptions::pooled())
        .await
        .expect("connect through bastion");
    assert_eq!(harness.manager.pooled_hosts(), vec!["inner".to_string()]);
    let bastion = transport.sessions_for("bastion")[0].clone();
    assert!(!bastion.is_closed());
    assert!(conn.is_connected());
    assert_eq!(conn.via().map(|hop| hop.host_id()), Some("bastion"));

    // Served from the pool, no new handshake anywhere.
    harness
        .manager
        .connect("inner", ConnectOptions::pooled())
        .await
        .expect("pooled");
    assert_eq!(transport.attempts_for("inner"), 1);
    assert_eq!(transport.attempts_for("bastion"), 1);

    // Displacing the target closes the hop it kept alive.
    harness
        .manager
        .connect("other", ConnectOptions::pooled())
        .await
        .expect("connect other");
    assert_eq!(harness.manager.pooled_hosts(), vec!["other".to_string()]);
    assert!(transport.sessions_for("inner")[0].is_closed());
    assert!(bastion.is_closed());
    assert!(!conn.is_connected());
    harness.manager.disconnect_all().await;
}
