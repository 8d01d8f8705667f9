//! End-to-end peer lifecycle through the network manager.

mod common;

use std::sync::Arc;

use common::{config_with, harness, next_report, with_pool};
use keygate::{Mode, NetConfig, NmError, Peer};

fn office() -> NetConfig {
    NetConfig::new("wg0", "office")
        .with_approve_mode(Mode::Manual)
        .with_activate_mode(Mode::Auto)
}

fn open_network(id: &str) -> NetConfig {
    NetConfig::new(id, id)
        .with_approve_mode(Mode::Auto)
        .with_activate_mode(Mode::Auto)
}

#[tokio::test]
async fn test_manual_approval_with_auto_activation() {
    let h = harness(config_with(vec![office()])).await;
    let mut reports = h.manager.subscribe_sync().expect("driver in service");

    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");
    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.staged_peers.contains_key("pk1"));
    assert!(net.approved_peers.is_empty());
    assert!(net.active_peers.is_empty());
    assert!(h.manager.sync_status("wg0").is_none());

    h.manager.approve("wg0", "pk1").await.expect("approve");
    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.staged_peers.is_empty());
    assert!(net.approved_peers.contains_key("pk1"));
    assert!(net.active_peers.contains_key("pk1"));
    assert_eq!(h.manager.sync_status("wg0").expect("status").dispatched, 1);

    let report = next_report(&mut reports).await;
    assert!(report.succeeded());
    assert_eq!(report.network_id, "wg0");
    let applied = h.driver.last_applied("wg0").expect("applied");
    assert!(applied.active_peers.contains_key("pk1"));
}

#[tokio::test]
async fn test_auto_approval_without_auto_activation() {
    let net = NetConfig::new("wg0", "office").with_approve_mode(Mode::Auto);
    let h = harness(config_with(vec![net])).await;

    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");

    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.staged_peers.is_empty());
    assert!(net.approved_peers.contains_key("pk1"));
    assert!(net.active_peers.is_empty());
    assert!(h.manager.sync_status("wg0").is_none());

    h.manager.activate("wg0", "pk1").await.expect("activate");
    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.active_peers.contains_key("pk1"));
}

#[tokio::test]
async fn test_registration_clears_caller_addresses() {
    let h = harness(config_with(vec![office()])).await;
    let peer = Peer::new("pk1").with_address("192.0.2.7/32".parse().expect("cidr"));

    h.manager.register("wg0", peer).await.expect("register");

    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.staged_peers["pk1"].addresses.is_empty());
}

#[tokio::test]
async fn test_unknown_keys_are_not_found() {
    let h = harness(config_with(vec![office()])).await;

    let err = h.manager.approve("wg0", "ghost").await.expect_err("not staged");
    assert!(matches!(err, NmError::UnknownPeer { .. }));

    let err = h
        .manager
        .activate("wg0", "ghost")
        .await
        .expect_err("not approved");
    assert!(matches!(err, NmError::UnknownPeer { .. }));

    let err = h
        .manager
        .disapprove("wg0", "ghost")
        .await
        .expect_err("not approved");
    assert!(matches!(err, NmError::UnknownPeer { .. }));
}

#[tokio::test]
async fn test_staged_peer_cannot_be_activated() {
    let h = harness(config_with(vec![office()])).await;
    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");

    let err = h
        .manager
        .activate("wg0", "pk1")
        .await
        .expect_err("staged only");
    assert!(matches!(err, NmError::UnknownPeer { .. }));
}

#[tokio::test]
async fn test_deactivate_is_idempotent() {
    let h = harness(config_with(vec![open_network("wg0")])).await;
    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");
    assert_eq!(h.manager.sync_status("wg0").expect("status").dispatched, 1);

    h.manager.deactivate("wg0", "pk1").await.expect("deactivate");
    h.manager
        .deactivate("wg0", "pk1")
        .await
        .expect("deactivate again");
    h.manager
        .deactivate("wg0", "never-seen")
        .await
        .expect("deactivate unknown key");

    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.active_peers.is_empty());
    assert!(net.approved_peers.contains_key("pk1"));
    // Only the first deactivation changed membership.
    assert_eq!(h.manager.sync_status("wg0").expect("status").dispatched, 2);
}

#[tokio::test]
async fn test_unknown_network() {
    let h = harness(config_with(vec![office()])).await;

    let err = h
        .manager
        .register("wg9", Peer::new("pk1"))
        .await
        .expect_err("unknown network");
    assert!(matches!(err, NmError::UnknownNetwork(ref id) if id == "wg9"));
    assert!(matches!(
        h.manager.get_net("wg9").await,
        Err(NmError::UnknownNetwork(_))
    ));
    assert!(matches!(
        h.manager.deactivate("wg9", "pk1").await,
        Err(NmError::UnknownNetwork(_))
    ));
}

#[tokio::test]
async fn test_zero_expiry_never_schedules() {
    let h = harness(config_with(vec![open_network("wg0")])).await;
    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");

    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.approval_expirations.is_empty());
    assert!(net.activation_expirations.is_empty());
    assert!(!h.manager.uses_expiry());
}

#[tokio::test]
async fn test_expiry_schedules_are_set() {
    let net = open_network("wg0")
        .with_approve_expiry_secs(3600)
        .with_activate_expiry_secs(60);
    let h = harness(config_with(vec![net])).await;

    let before = chrono::Utc::now();
    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");
    let after = chrono::Utc::now();

    let net = h.manager.get_net("wg0").await.expect("net");
    let approval = net.approval_expirations["pk1"];
    let activation = net.activation_expirations["pk1"];
    assert!(approval >= before + chrono::Duration::seconds(3600));
    assert!(approval <= after + chrono::Duration::seconds(3600));
    assert!(activation >= before + chrono::Duration::seconds(60));
    assert!(activation <= after + chrono::Duration::seconds(60));
}

#[tokio::test]
async fn test_rejected_registration_stages_nothing() {
    let net = office().with_hook("wireguard-key").with_hook("require-owner");
    let h = harness(config_with(vec![net])).await;

    let err = h
        .manager
        .register("wg0", Peer::new("not-a-key"))
        .await
        .expect_err("bad key");
    assert!(matches!(err, NmError::Rejected { ref hook, .. } if hook == "wireguard-key"));

    let key = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    let err = h
        .manager
        .register("wg0", Peer::new(key))
        .await
        .expect_err("no owner");
    assert!(matches!(err, NmError::Rejected { ref hook, .. } if hook == "require-owner"));

    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.staged_peers.is_empty());

    h.manager
        .register("wg0", Peer::new(key).with_info("owner", "alice"))
        .await
        .expect("valid registration");
    let net = h.manager.get_net("wg0").await.expect("net");
    assert_eq!(net.staged_peers[key].info["owner"], "alice");
}

#[tokio::test]
async fn test_disapprove_removes_and_releases() {
    let net = open_network("wg0").with_addresser("pool");
    let config = with_pool(config_with(vec![net]), "pool", "10.20.0.0/30");
    let h = harness(config).await;

    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");
    let address = h.manager.get_net("wg0").await.expect("net").approved_peers["pk1"].addresses[0];

    // The /30 pool has two hosts; fill the second.
    h.manager
        .register("wg0", Peer::new("pk2"))
        .await
        .expect("register second");
    let err = h
        .manager
        .register("wg0", Peer::new("pk3"))
        .await
        .expect_err("pool exhausted");
    assert!(matches!(err, NmError::AddressExhausted(_)));

    h.manager.disapprove("wg0", "pk1").await.expect("disapprove");
    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(!net.approved_peers.contains_key("pk1"));
    assert!(!net.active_peers.contains_key("pk1"));
    assert!(!net.staged_peers.contains_key("pk1"));

    // pk3 stayed staged and can now take the freed address.
    h.manager.approve("wg0", "pk3").await.expect("approve pk3");
    let net = h.manager.get_net("wg0").await.expect("net");
    assert_eq!(net.approved_peers["pk3"].addresses[0], address);
}

#[tokio::test]
async fn test_addresses_assigned_per_allocator() {
    let net = office().with_addresser("pool");
    let config = with_pool(config_with(vec![net]), "pool", "10.30.0.0/24");
    let h = harness(config).await;

    let mut reports = h.manager.subscribe_sync().expect("driver");

    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register");
    h.manager.approve("wg0", "pk1").await.expect("approve");
    assert!(next_report(&mut reports).await.succeeded());

    let applied = h.driver.last_applied("wg0").expect("applied");
    let peer = &applied.active_peers["pk1"];
    assert_eq!(peer.addresses.len(), 1);
    assert_eq!(peer.addresses[0].to_string(), "10.30.0.1/32");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_are_not_lost() {
    let h = harness(config_with(vec![open_network("wg0"), open_network("wg1")])).await;

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let manager = Arc::clone(&h.manager);
            let network = if i % 2 == 0 { "wg0" } else { "wg1" };
            tokio::spawn(async move {
                manager
                    .register(network, Peer::new(format!("pk{i}")))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("task").expect("register");
    }

    for network in ["wg0", "wg1"] {
        let net = h.manager.get_net(network).await.expect("net");
        assert_eq!(net.approved_peers.len(), 20);
        assert_eq!(net.active_peers.len(), 20);
    }

    h.manager.shutdown().await;
    for network in ["wg0", "wg1"] {
        let applied = h.driver.last_applied(network).expect("applied");
        assert_eq!(applied.active_peers.len(), 20);
    }
}

#[tokio::test]
async fn test_failed_sync_does_not_fail_operation() {
    let driver = keygate::driver::FakeDriver::new().failing(100);
    let h = common::harness_with_driver(config_with(vec![open_network("wg0")]), driver).await;
    let mut reports = h.manager.subscribe_sync().expect("driver");

    h.manager
        .register("wg0", Peer::new("pk1"))
        .await
        .expect("register succeeds despite driver");

    let report = next_report(&mut reports).await;
    assert!(!report.succeeded());
    let status = h.manager.sync_status("wg0").expect("status");
    assert_eq!(status.failed, 1);
    assert!(status.last_error.is_some());
    let net = h.manager.get_net("wg0").await.expect("net");
    assert!(net.active_peers.contains_key("pk1"));
}
