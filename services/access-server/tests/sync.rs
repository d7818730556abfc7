//! Integration tests for peer-table reconciliation and the background loops.


use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use harness::{device, key, scripted_engine, Harness, RecordingPeers, POLL, SETTLE};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use wga_access_server::inactive::InactivityPruner;
use wga_access_server::metadata::MetadataCollector;
use wga_access_server::peers::{MemoryPeerTable, PeerCalls, PeerTable};
use wga_access_server::registry::{DeviceRegistry, MemoryRegistry, RegistryEvent};
use wga_access_server::{DeviceEngine, Identity, Peer, ReconcileStats, SyncOptions};
use wga_networking::AddressPools;

fn fast_sync() -> SyncOptions {
    SyncOptions {
        disable_metadata: true,
        disable_inactivity_pruning: true,
        ..Default::default()
    }
}

// ============================================================================
// Full reconcile
// ============================================================================

#[tokio::test]
async fn test_full_reconcile_removes_orphans_only() {
    let h = Harness::ipv4("10.44.0.0/24");
    let laptop = h
        .engine
        .create_device(&Identity::subject("alice"), "laptop", &key(1), None)
        .await
        .unwrap();

    h.peers
        .seed(Peer::new(key(1), laptop.addresses().unwrap()))
        .await;
    h.peers
        .seed(Peer::new(key(99), vec!["10.44.0.50/32".parse().unwrap()]))
        .await;

    let stats = h.engine.full_reconcile().await.unwrap();

    assert_eq!(
        stats,
        ReconcileStats {
            removed: 1,
            upserted: 0,
            unchanged: 1,
            failed: 0
        }
    );
    assert!(h.peers.peer(&key(99)).await.is_none());
    assert!(h.peers.peer(&key(1)).await.is_some());
}

#[tokio::test]
async fn test_full_reconcile_is_idempotent() {
    let h = Harness::new(Some("10.44.0.0/24"), Some("fd00::/64"));
    for i in 1..=3u8 {
        h.engine
            .create_device(&Identity::subject("alice"), &format!("d{i}"), &key(i), None)
            .await
            .unwrap();
    }
    h.peers.seed(Peer::new(key(50), vec![])).await;

    let first = h.engine.full_reconcile().await.unwrap();
    assert_eq!(first.upserted, 3);
    assert_eq!(first.removed, 1);
    assert_eq!(h.peers.calls(), PeerCalls { adds: 3, removes: 1 });

    h.peers.reset_calls();
    let second = h.engine.full_reconcile().await.unwrap();
    assert_eq!(second.upserted, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(h.peers.calls(), PeerCalls::default());
}

#[tokio::test]
async fn test_full_reconcile_continues_past_bad_records() {
    let h = Harness::ipv4("10.44.0.0/24");
    let now = Utc::now();
    h.registry
        .save(&device("alice", "broken", &key(1), "garbage", now))
        .await
        .unwrap();
    h.registry
        .save(&device("alice", "bad-key", "not-a-key", "10.44.0.3/32", now))
        .await
        .unwrap();
    h.registry
        .save(&device("alice", "good", &key(2), "10.44.0.4/32", now))
        .await
        .unwrap();
    // Peer for the unparseable record must survive: it is not an orphan.
    h.peers.seed(Peer::new(key(1), vec![])).await;

    let stats = h.engine.full_reconcile().await.unwrap();

    assert_eq!(stats.upserted, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.removed, 0);
    assert!(h.peers.peer(&key(1)).await.is_some());
    assert!(h.peers.peer(&key(2)).await.is_some());
}

#[tokio::test]
async fn test_full_reconcile_removes_old_key_before_adding_new_one() {
    // The device was re-keyed; its old peer still holds the address.
    let registry = Arc::new(MemoryRegistry::new());
    let peers = Arc::new(RecordingPeers::new(Arc::new(MemoryPeerTable::new())));
    let engine = DeviceEngine::new(
        registry.clone(),
        peers.clone(),
        AddressPools::new(Some("10.44.0.0/24"), None).unwrap(),
    );

    registry
        .save(&device("alice", "laptop", &key(2), "10.44.0.2/32", Utc::now()))
        .await
        .unwrap();
    peers
        .inner
        .seed(Peer::new(key(1), vec!["10.44.0.2/32".parse().unwrap()]))
        .await;

    let stats = engine.full_reconcile().await.unwrap();

    assert_eq!(stats.removed, 1);
    assert_eq!(stats.upserted, 1);
    assert_eq!(
        peers.log().await,
        vec![format!("remove {}", key(1)), format!("add {}", key(2))]
    );
}

// ============================================================================
// Event-driven sync
// ============================================================================

#[tokio::test]
async fn test_start_sync_reconciles_existing_devices() {
    let h = Harness::ipv4("10.44.0.0/24");
    h.registry
        .save(&device("alice", "laptop", &key(1), "10.44.0.2/32", Utc::now()))
        .await
        .unwrap();
    h.peers.seed(Peer::new(key(42), vec![])).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = h.engine.start_sync(fast_sync(), shutdown_rx).await.unwrap();

    // Done before start_sync returns.
    assert!(h.peers.peer(&key(1)).await.is_some());
    assert!(h.peers.peer(&key(42)).await.is_none());
    assert_eq!(sync.task_names(), vec!["dispatcher"]);
    sync.abort();
}

#[tokio::test]
async fn test_events_add_and_remove_peers() {
    let h = Harness::ipv4("10.44.0.0/24");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = h.engine.start_sync(fast_sync(), shutdown_rx).await.unwrap();

    let laptop = h
        .engine
        .create_device(&Identity::subject("alice"), "laptop", &key(1), Some(&key(7)))
        .await
        .unwrap();

    timeout(SETTLE, async {
        while h.peers.peer(&key(1)).await.is_none() {
            sleep(POLL).await;
        }
    })
    .await
    .expect("peer added after create");
    assert_eq!(
        h.peers.peer(&key(1)).await.unwrap().allowed_ips,
        laptop.addresses().unwrap()
    );
    assert_eq!(h.peers.preshared_key(&key(1)).await, Some(key(7)));

    h.engine.delete_device("alice", "laptop").await.unwrap();

    timeout(SETTLE, async {
        while !h.peers.is_empty().await {
            sleep(POLL).await;
        }
    })
    .await
    .expect("peer removed after delete");

    shutdown_tx.send(true).unwrap();
    timeout(SETTLE, sync.join()).await.expect("sync tasks stop");
}

#[tokio::test]
async fn test_reconnect_triggers_full_resync() {
    let h = Harness::ipv4("10.44.0.0/24");
    for i in 1..=3u8 {
        h.engine
            .create_device(&Identity::subject("alice"), &format!("d{i}"), &key(i), None)
            .await
            .unwrap();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = h.engine.start_sync(fast_sync(), shutdown_rx).await.unwrap();
    assert_eq!(h.peers.len().await, 3);

    // The tunnel endpoint lost its peers while events were not flowing.
    for i in 1..=3u8 {
        h.peers.remove_peer(&key(i)).await.unwrap();
    }
    h.peers.seed(Peer::new(key(77), vec![])).await;

    h.registry.notify_reconnect();

    timeout(SETTLE, async {
        while h.peers.len().await != 3 || h.peers.peer(&key(77)).await.is_some() {
            sleep(POLL).await;
        }
    })
    .await
    .expect("peer table resynced after reconnect");

    shutdown_tx.send(true).unwrap();
    timeout(SETTLE, sync.join()).await.expect("sync tasks stop");
}

#[tokio::test]
async fn test_start_sync_fails_when_registry_down() {
    let h = Harness::ipv4("10.44.0.0/24");
    h.registry.set_unavailable(true);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    assert!(h.engine.start_sync(fast_sync(), shutdown_rx).await.is_err());
}

#[tokio::test]
async fn test_start_sync_launches_enabled_loops() {
    let h = Harness::ipv4("10.44.0.0/24");
    let options = SyncOptions {
        disable_metadata: false,
        disable_inactivity_pruning: false,
        metadata_interval: Duration::from_millis(20),
        prune_interval: Duration::from_millis(20),
        ..Default::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = h.engine.start_sync(options, shutdown_rx).await.unwrap();
    assert_eq!(sync.task_names(), vec!["dispatcher", "metadata", "inactivity"]);

    sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();
    timeout(SETTLE, sync.join()).await.expect("sync tasks stop");
}

// ============================================================================
// Metadata collection
// ============================================================================

#[tokio::test]
async fn test_metadata_copied_for_fresh_handshake() {
    let h = Harness::ipv4("10.44.0.0/24");
    let now = Utc::now();
    h.registry
        .save(&device("alice", "laptop", &key(1), "10.44.0.2/32", now))
        .await
        .unwrap();
    h.peers.seed(Peer::new(key(1), vec![])).await;
    h.peers
        .observe(
            &key(1),
            Some("203.0.113.7:51820".parse().unwrap()),
            Some(now - ChronoDuration::seconds(20)),
            1000,
            2000,
        )
        .await;

    let collector = MetadataCollector::new(h.engine.clone(), Duration::from_secs(30));
    assert_eq!(collector.collect_at(now).await.unwrap(), 1);

    let stored = h.registry.get("alice", "laptop").await.unwrap();
    assert_eq!(stored.receive_bytes, 1000);
    assert_eq!(stored.transmit_bytes, 2000);
    assert_eq!(stored.endpoint.as_deref(), Some("203.0.113.7:51820"));
    assert!(stored.connected_at(now));
}

#[tokio::test]
async fn test_metadata_not_clobbered_when_stale_everywhere() {
    let h = Harness::ipv4("10.44.0.0/24");
    let now = Utc::now();
    let stale = now - ChronoDuration::minutes(10);

    let mut laptop = device("alice", "laptop", &key(1), "10.44.0.2/32", now - ChronoDuration::days(1));
    laptop.last_handshake_time = Some(stale);
    laptop.receive_bytes = 5;
    laptop.endpoint = Some("198.51.100.1:4000".to_string());
    h.registry.save(&laptop).await.unwrap();

    h.peers.seed(Peer::new(key(1), vec![])).await;
    h.peers
        .observe(&key(1), Some("203.0.113.7:51820".parse().unwrap()), Some(stale), 999, 999)
        .await;

    let collector = MetadataCollector::new(h.engine.clone(), Duration::from_secs(30));
    assert_eq!(collector.collect_at(now).await.unwrap(), 0);

    assert_eq!(h.registry.get("alice", "laptop").await.unwrap(), laptop);
}

#[tokio::test]
async fn test_metadata_updated_when_stored_handshake_fresh() {
    // Device was connected recently; this instance now sees it gone quiet.
    let h = Harness::ipv4("10.44.0.0/24");
    let now = Utc::now();

    let mut laptop = device("alice", "laptop", &key(1), "10.44.0.2/32", now - ChronoDuration::days(1));
    laptop.last_handshake_time = Some(now - ChronoDuration::seconds(30));
    h.registry.save(&laptop).await.unwrap();

    let peer_handshake = now - ChronoDuration::minutes(5);
    h.peers.seed(Peer::new(key(1), vec![])).await;
    h.peers
        .observe(&key(1), Some("203.0.113.7:51820".parse().unwrap()), Some(peer_handshake), 1, 2)
        .await;

    let collector = MetadataCollector::new(h.engine.clone(), Duration::from_secs(30));
    assert_eq!(collector.collect_at(now).await.unwrap(), 1);

    let stored = h.registry.get("alice", "laptop").await.unwrap();
    assert_eq!(stored.last_handshake_time, Some(peer_handshake));
    assert!(!stored.connected_at(now));
}

#[tokio::test]
async fn test_metadata_skips_peers_without_endpoint_or_device() {
    let h = Harness::ipv4("10.44.0.0/24");
    let now = Utc::now();
    h.registry
        .save(&device("alice", "laptop", &key(1), "10.44.0.2/32", now))
        .await
        .unwrap();

    // Registered but never handshaken.
    h.peers.seed(Peer::new(key(1), vec![])).await;
    // Handshaken but unknown to the registry.
    h.peers.seed(Peer::new(key(2), vec![])).await;
    h.peers
        .observe(&key(2), Some("203.0.113.7:51820".parse().unwrap()), Some(now), 1, 1)
        .await;

    let collector = MetadataCollector::new(h.engine.clone(), Duration::from_secs(30));
    assert_eq!(collector.collect_at(now).await.unwrap(), 0);
    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn test_metadata_does_not_recreate_device_deleted_mid_pass() {
    let (registry, peers, engine) = scripted_engine("10.0.0.0/30");
    let now = Utc::now();
    engine
        .create_device(&Identity::subject("alice"), "laptop", &key(1), None)
        .await
        .unwrap();
    peers.seed(Peer::new(key(1), vec![])).await;
    peers
        .observe(&key(1), Some("203.0.113.7:51820".parse().unwrap()), Some(now), 10, 20)
        .await;
    let mut events = registry.subscribe();

    let (reached, resume) = registry.pause_next_key_lookup().await;
    let collector = MetadataCollector::new(engine.clone(), Duration::from_secs(30));
    let pass = tokio::spawn(async move { collector.collect_at(now).await });

    // Between the collector's lookup and its write: the device is deleted
    // and its address handed to a new device.
    reached.await.unwrap();
    engine.delete_device("alice", "laptop").await.unwrap();
    let phone = engine
        .create_device(&Identity::subject("bob"), "phone", &key(2), None)
        .await
        .unwrap();
    assert_eq!(phone.address, "10.0.0.2/32");
    resume.send(()).unwrap();

    assert_eq!(pass.await.unwrap().unwrap(), 0);

    let devices = engine.list_all_devices().await.unwrap();
    assert_eq!(devices, vec![phone]);
    assert!(registry.inner.get("alice", "laptop").await.unwrap_err().is_not_found());

    assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Deleted(d) if d.name == "laptop"));
    assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Added(d) if d.name == "phone"));
    assert!(events.try_recv().is_err());
}

// ============================================================================
// Inactivity pruning
// ============================================================================

#[tokio::test]
async fn test_pruning_boundary_for_never_connected_device() {
    let h = Harness::ipv4("10.44.0.0/24");
    let created = Utc::now() - ChronoDuration::days(30);
    let grace = Duration::from_secs(3600);
    h.registry
        .save(&device("alice", "laptop", &key(1), "10.44.0.2/32", created))
        .await
        .unwrap();

    let pruner = InactivityPruner::new(h.engine.clone(), grace, Duration::from_secs(30));

    let before = created + ChronoDuration::seconds(3600 - 1);
    assert_eq!(pruner.prune_at(before).await.unwrap(), 0);
    assert_eq!(h.registry.len().await, 1);

    let after = created + ChronoDuration::seconds(3600 + 1);
    assert_eq!(pruner.prune_at(after).await.unwrap(), 1);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_pruning_uses_last_handshake_when_present() {
    let h = Harness::ipv4("10.44.0.0/24");
    let now = Utc::now();
    let grace = Duration::from_secs(3600);

    let mut active = device("alice", "active", &key(1), "10.44.0.2/32", now - ChronoDuration::days(365));
    active.last_handshake_time = Some(now - ChronoDuration::minutes(5));
    h.registry.save(&active).await.unwrap();

    let mut idle = device("alice", "idle", &key(2), "10.44.0.3/32", now - ChronoDuration::days(365));
    idle.last_handshake_time = Some(now - ChronoDuration::hours(2));
    h.registry.save(&idle).await.unwrap();

    let pruner = InactivityPruner::new(h.engine.clone(), grace, Duration::from_secs(30));
    assert_eq!(pruner.prune_at(now).await.unwrap(), 1);

    let remaining = h.engine.list_all_devices().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "active");
}

#[tokio::test]
async fn test_pruned_device_peer_removed_via_events() {
    let h = Harness::ipv4("10.44.0.0/24");
    let created = Utc::now() - ChronoDuration::days(100);
    h.registry
        .save(&device("alice", "laptop", &key(1), "10.44.0.2/32", created))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = h.engine.start_sync(fast_sync(), shutdown_rx).await.unwrap();
    assert!(h.peers.peer(&key(1)).await.is_some());

    let pruner = InactivityPruner::new(
        h.engine.clone(),
        Duration::from_secs(90 * 24 * 3600),
        Duration::from_secs(30),
    );
    assert_eq!(pruner.prune_at(Utc::now()).await.unwrap(), 1);

    timeout(SETTLE, async {
        while !h.peers.is_empty().await {
            sleep(POLL).await;
        }
    })
    .await
    .expect("peer removed after pruning");

    shutdown_tx.send(true).unwrap();
    timeout(SETTLE, sync.join()).await.expect("sync tasks stop");
}

#[tokio::test]
async fn test_pruning_continues_past_failed_delete() {
    let (registry, _, engine) = scripted_engine("10.44.0.0/24");
    let created = Utc::now() - ChronoDuration::days(100);
    for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
        let address = format!("10.44.0.{}/32", i + 2);
        registry
            .save(&device("alice", name, &key(i as u8 + 1), &address, created))
            .await
            .unwrap();
    }
    registry.fail_delete_of("b").await;

    let pruner = InactivityPruner::new(
        engine.clone(),
        Duration::from_secs(90 * 24 * 3600),
        Duration::from_secs(30),
    );
    assert_eq!(pruner.prune_at(Utc::now()).await.unwrap(), 2);

    let remaining = engine.list_all_devices().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "b");
}
