use crate::*;

use std::path::PathBuf;
use std::sync::Arc;

use overnet_control::{ControlError, JsonNetworkStore, MemoryNetworkStore, NetworkEvent, NetworkStore};
use overnet_core::crypto::random_bytes;
use overnet_testkit::{connect, eventually, init_tracing, test_config, wait_for_event};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

fn temp_store_path() -> PathBuf {
    let suffix = u64::from_le_bytes(random_bytes::<8>());
    std::env::temp_dir()
        .join(format!("overnet-it-{}-{suffix:016x}", std::process::id()))
        .join("networks.json")
}

// ── Networks ──────────────────────────────────────────────────────────────────

/// Removing a network severs every binding for it, locally and on the
/// neighbor, and forgets its certificate.
#[tokio::test]
async fn remove_severs_bindings() -> Result<()> {
    init_tracing();
    let (net, other) = (TestNetwork::new("net"), TestNetwork::new("other"));
    let alice = TestNode::new("alice");
    let bob = TestNode::new("bob");
    join(&alice, &net, 1).await?;
    join(&alice, &other, 2).await?;
    join(&bob, &net, 1).await?;
    join(&bob, &other, 2).await?;

    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;
    let (key, other_key) = (net.key(), other.key());
    assert!(eventually(WAIT, || async {
        is_open(&conn.a_peer, &key).await
            && is_open(&conn.b_peer, &key).await
            && is_open(&conn.a_peer, &other_key).await
    })
    .await);

    let mut alice_events = alice.subscribe();
    alice.control.remove(1).await?;

    assert!(!conn.a_peer.has_network_binding(&key).await);
    assert!(alice.control.certificate(&key).is_none());
    assert!(alice.control.network(1).await.is_none());
    assert!(!alice.host.has_network(&key));
    assert!(wait_for_event(&mut alice_events, WAIT, |e| {
        matches!(e, Event::NetworkPeerClose { network_id: 1, .. })
    })
    .await
    .is_some());

    // The neighbor drops its side; its own membership survives.
    assert!(eventually(WAIT, || async { !conn.b_peer.has_network_binding(&key).await }).await);
    assert!(bob.host.peer_ports(&key, alice.host_id).is_none());
    assert!(bob.control.certificate(&key).is_some());
    assert!(eventually(WAIT, || async { bob.control.peer_count(1).await == Some(0) }).await);

    // The other network is untouched, and so is the link.
    assert!(is_open(&conn.a_peer, &other_key).await);
    assert!(alice.control.peer(1).is_some());
    Ok(())
}

#[tokio::test]
async fn add_and_remove_report_unknown_and_duplicate_ids() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let node = TestNode::new("alice");
    let network = join(&node, &net, 1).await?;

    let err = node.control.add(network).await.unwrap_err();
    assert!(matches!(err, ControlError::DuplicateNetwork(1)), "{err}");

    let err = node.control.remove(9).await.unwrap_err();
    assert!(matches!(err, ControlError::NetworkNotFound), "{err}");

    let err = node.control.set_alt_profile_name(9, "x").await.unwrap_err();
    assert!(matches!(err, ControlError::NetworkNotFound), "{err}");
    Ok(())
}

/// When the overlay refuses a change, the stored record is put back and
/// the node keeps serving what it had.
#[tokio::test]
async fn overlay_failure_leaves_store_and_node_in_step() -> Result<()> {
    init_tracing();
    let (net, late) = (TestNetwork::new("net"), TestNetwork::new("late"));
    let store = MemoryNetworkStore::new();
    let node = TestNode::with_store("alice", test_config(), Arc::new(store.clone()));
    node.dialer.register(net.authority());
    let network = join_provisional(&node, &net, 1).await?;
    let key = net.key();

    node.host.set_failing(true);

    let err = join(&node, &late, 2).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<ControlError>(), Some(ControlError::Host(_))), "{err}");
    assert!(store.get(2).is_none());
    assert!(node.control.network(2).await.is_none());
    assert!(node.control.certificate(&late.key()).is_none());

    let err = node.control.remove(1).await.unwrap_err();
    assert!(matches!(err, ControlError::Host(_)), "{err}");
    assert_eq!(store.get(1).map(|n| n.id), Some(1));
    assert!(node.control.network(1).await.is_some());
    assert!(node.control.certificate(&key).is_some());
    assert!(node.host.has_network(&key));

    let err = node.control.renew_certificate(&network).await.unwrap_err();
    assert!(matches!(err, ControlError::Host(_)), "{err}");
    assert!(net.authority().requests() >= 1);
    assert!(!store.get(1).expect("stored").certificate.is_trusted());
    assert!(!node.control.certificate(&key).expect("cert").is_trusted());

    // Once the overlay recovers, the same operations go through.
    node.host.set_failing(false);
    node.control.renew_certificate(&network).await?;
    assert!(store.get(1).expect("stored").certificate.is_trusted());
    node.control.remove(1).await?;
    assert!(store.get(1).is_none());
    Ok(())
}

// ── Peers ─────────────────────────────────────────────────────────────────────

/// A disconnected neighbor's bindings are closed and its peer forgotten.
#[tokio::test]
async fn remove_peer_closes_bindings() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let alice = TestNode::new("alice");
    let bob = TestNode::new("bob");
    join(&alice, &net, 1).await?;
    join(&bob, &net, 1).await?;

    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;
    let key = net.key();
    assert!(eventually(WAIT, || is_open(&conn.a_peer, &key)).await);
    assert!(eventually(WAIT, || async { alice.control.peer_count(1).await == Some(1) }).await);

    let mut alice_events = alice.subscribe();
    alice.control.remove_peer(1).await;

    assert!(alice.control.peer(1).is_none());
    assert!(!conn.a_peer.has_network_binding(&key).await);
    assert!(alice.host.peer_ports(&key, bob.host_id).is_none());
    assert!(wait_for_event(&mut alice_events, WAIT, |e| matches!(e, Event::PeerRemove { peer_id: 1 }))
        .await
        .is_some());
    assert!(eventually(WAIT, || async { alice.control.peer_count(1).await == Some(0) }).await);

    // The network itself stays.
    assert!(alice.host.has_network(&key));
    assert!(alice.control.certificate(&key).is_some());
    Ok(())
}

// ── Observers ─────────────────────────────────────────────────────────────────

/// A late subscriber first sees every running network, then live changes.
#[tokio::test]
async fn read_events_starts_with_snapshot() -> Result<()> {
    init_tracing();
    let (one, two, three) = (TestNetwork::new("one"), TestNetwork::new("two"), TestNetwork::new("three"));
    let node = TestNode::new("alice");
    join(&node, &one, 1).await?;
    join(&node, &two, 2).await?;
    node.start();

    let cancel = CancellationToken::new();
    let mut stream = node.control.read_events(cancel.clone()).await;

    let mut started = Vec::new();
    for _ in 0..2 {
        match tokio::time::timeout(WAIT, stream.next()).await? {
            Some(NetworkEvent::NetworkStart { network, peer_count }) => {
                assert_eq!(peer_count, 0);
                started.push(network.id);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
    started.sort_unstable();
    assert_eq!(started, vec![1, 2]);

    join(&node, &three, 3).await?;
    match tokio::time::timeout(WAIT, stream.next()).await? {
        Some(NetworkEvent::NetworkStart { network, .. }) => assert_eq!(network.id, 3),
        other => panic!("expected start of 3, got {other:?}"),
    }

    node.control.remove(1).await?;
    match tokio::time::timeout(WAIT, stream.next()).await? {
        Some(NetworkEvent::NetworkStop { network_id }) => assert_eq!(network_id, 1),
        other => panic!("expected stop of 1, got {other:?}"),
    }

    cancel.cancel();
    assert!(tokio::time::timeout(WAIT, stream.next()).await?.is_none());
    Ok(())
}

// ── Startup and shutdown ──────────────────────────────────────────────────────

/// Networks persisted by one run are routed by the next.
#[tokio::test]
async fn stored_networks_start_on_run() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let path = temp_store_path();

    let profile_key = {
        let first = TestNode::with_store("alice", test_config(), Arc::new(JsonNetworkStore::open(&path)?));
        join(&first, &net, 4).await?;
        first.profile.key.clone()
    };
    let stored = JsonNetworkStore::open(&path)?.load()?;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].certificate.is_owned_by(&profile_key.public));

    let second = TestNode::with_store("alice", test_config(), Arc::new(JsonNetworkStore::open(&path)?));
    let mut events = second.subscribe();
    second.start();

    let started = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, Event::NetworkStart { network } if network.id == 4)
    })
    .await;
    assert!(started.is_some());
    assert!(second.host.has_network(&net.key()));
    assert!(second.control.certificate(&net.key()).is_some());

    second.control.remove(4).await?;
    assert!(JsonNetworkStore::open(&path)?.load()?.is_empty());

    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
    Ok(())
}

#[tokio::test]
async fn run_twice_is_rejected_and_shutdown_stops() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let store = MemoryNetworkStore::with_networks([net.network(1, net.member_certificate(
        &overnet_core::Keypair::generate(),
        "alice",
    ))]);
    let node = TestNode::with_store("alice", test_config(), Arc::new(store));
    let mut events = node.subscribe();
    let handle = node.start();

    // Stored networks only start once the loop owns the event receiver.
    assert!(wait_for_event(&mut events, WAIT, |e| matches!(e, Event::NetworkStart { .. }))
        .await
        .is_some());
    let err = node.control.run().await.unwrap_err();
    assert!(matches!(err, ControlError::AlreadyRunning), "{err}");

    node.shutdown();
    tokio::time::timeout(WAIT, handle).await???;
    Ok(())
}
