use crate::*;

use std::sync::Arc;

use overnet_control::MemoryNetworkStore;
use overnet_core::ControlConfig;
use overnet_testkit::{connect, eventually, init_tracing, test_config, wait_for_event};

/// {X, Y} against {Y, Z}: exactly Y is bound, on both sides, once.
#[tokio::test]
async fn binds_only_shared_networks() -> Result<()> {
    init_tracing();
    let (x, y, z) = (TestNetwork::new("x"), TestNetwork::new("y"), TestNetwork::new("z"));
    let alice = TestNode::new("alice");
    let bob = TestNode::new("bob");

    join(&alice, &x, 1).await?;
    join(&alice, &y, 2).await?;
    join(&bob, &y, 7).await?;
    join(&bob, &z, 8).await?;

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;

    let event = wait_for_event(&mut alice_events, WAIT, |e| matches!(e, Event::NetworkPeerOpen { .. }))
        .await
        .expect("alice never opened a binding");
    match event {
        Event::NetworkPeerOpen { peer_id, network_id, network_key } => {
            assert_eq!(peer_id, 1);
            assert_eq!(network_id, 2);
            assert_eq!(network_key, y.key());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(wait_for_event(&mut bob_events, WAIT, opened(&y.key())).await.is_some());

    assert_eq!(conn.a_peer.network_keys().await, vec![y.key()]);
    assert_eq!(conn.b_peer.network_keys().await, vec![y.key()]);
    assert!(alice.host.peer_ports(&y.key(), bob.host_id).is_some());
    assert!(alice.host.peer_ports(&x.key(), bob.host_id).is_none());
    assert!(bob.host.peer_ports(&z.key(), alice.host_id).is_none());

    // Ports agree across the link.
    let a_binding = conn.a_peer.binding(&y.key()).await.expect("alice binding");
    let b_binding = conn.b_peer.binding(&y.key()).await.expect("bob binding");
    assert_eq!(a_binding.local_port, b_binding.peer_port);
    assert_eq!(a_binding.peer_port, b_binding.local_port);

    // No second open for the same network.
    let again = wait_for_event(
        &mut alice_events,
        Duration::from_millis(500),
        |e| matches!(e, Event::NetworkPeerOpen { .. }),
    )
    .await;
    assert!(again.is_none(), "duplicate open: {again:?}");

    assert!(eventually(WAIT, || async { alice.control.peer_count(2).await == Some(1) }).await);
    assert!(eventually(WAIT, || async { bob.control.peer_count(7).await == Some(1) }).await);
    assert_eq!(alice.control.peer_count(1).await, Some(0));
    Ok(())
}

/// Re-offering an already bound network reserves nothing.
#[tokio::test]
async fn rebinding_is_idempotent() -> Result<()> {
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
    assert!(eventually(WAIT, || async { !conn.a_peer.is_syncing() && !conn.b_peer.is_syncing() }).await);

    let reserved = conn.a_link.reserved_ports();
    let messages = conn.a_client.sent();
    let sent = conn.a_peer.send_network_bindings(&[key.clone()]).await?;
    assert!(sent.is_empty());
    assert_eq!(conn.a_link.reserved_ports(), reserved);
    // Still one (empty) Open, so the neighbor's exchange never stalls.
    assert_eq!(conn.a_client.sent(), messages + 1);
    assert!(is_open(&conn.a_peer, &key).await);
    Ok(())
}

/// Networks added after the link is up are negotiated too.
#[tokio::test]
async fn network_added_later_is_bound() -> Result<()> {
    init_tracing();
    let (first, second) = (TestNetwork::new("first"), TestNetwork::new("second"));
    let alice = TestNode::new("alice");
    let bob = TestNode::new("bob");
    join(&alice, &first, 1).await?;
    join(&bob, &first, 1).await?;

    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;
    let (first_key, second_key) = (first.key(), second.key());
    assert!(eventually(WAIT, || is_open(&conn.a_peer, &first_key)).await);
    assert!(eventually(WAIT, || is_open(&conn.b_peer, &first_key)).await);
    let idle = || async { !conn.a_peer.is_syncing() && !conn.b_peer.is_syncing() };
    assert!(eventually(WAIT, idle).await);

    // Alice's round finds nothing new to bind; wait it out so Bob's add
    // starts a fresh one on both sides.
    let mut alice_events = alice.subscribe();
    join(&alice, &second, 2).await?;
    assert!(
        wait_for_event(&mut alice_events, WAIT, |e| matches!(e, Event::NetworkNegotiationComplete { .. }))
            .await
            .is_some()
    );
    assert!(eventually(WAIT, idle).await);

    join(&bob, &second, 2).await?;
    assert!(eventually(WAIT, || async {
        is_open(&conn.a_peer, &second_key).await && is_open(&conn.b_peer, &second_key).await
    })
    .await);
    assert!(is_open(&conn.a_peer, &first_key).await);
    assert!(eventually(WAIT, || async { alice.control.peer_count(2).await == Some(1) }).await);
    Ok(())
}

/// A neighbor whose certificate lapsed is still admitted when no grace
/// bound is configured.
#[tokio::test]
async fn expired_peer_certificate_is_tolerated() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let alice = TestNode::new("alice");
    let bob = TestNode::new("bob");
    join(&alice, &net, 1).await?;
    let expired = net.expired_member_certificate(&bob.profile.key, "bob", Duration::from_secs(3600));
    bob.control.add(net.network(1, expired)).await?;

    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;
    let key = net.key();

    assert!(eventually(WAIT, || is_open(&conn.a_peer, &key)).await);
    Ok(())
}

/// With a grace bound, a certificate expired for longer is refused.
#[tokio::test]
async fn long_expired_peer_certificate_is_refused() -> Result<()> {
    init_tracing();
    let config = ControlConfig {
        expiry_grace_secs: 60,
        ..test_config()
    };
    let net = TestNetwork::new("net");
    let alice = TestNode::with_store(
        "alice",
        config,
        Arc::new(MemoryNetworkStore::new()),
    );
    let bob = TestNode::new("bob");
    join(&alice, &net, 1).await?;
    let expired = net.expired_member_certificate(&bob.profile.key, "bob", Duration::from_secs(3600));
    bob.control.add(net.network(1, expired)).await?;

    let mut alice_events = alice.subscribe();
    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;

    assert!(
        wait_for_event(&mut alice_events, WAIT, |e| matches!(e, Event::NetworkNegotiationComplete { .. }))
            .await
            .is_some()
    );
    assert!(eventually(WAIT, || async { !conn.a_peer.is_syncing() }).await);
    assert!(!conn.a_peer.has_network_binding(&net.key()).await);
    assert!(alice.host.peer_ports(&net.key(), bob.host_id).is_none());
    Ok(())
}

/// Nodes with nothing in common never bind, and nothing is left syncing.
#[tokio::test]
async fn disjoint_nodes_bind_nothing() -> Result<()> {
    init_tracing();
    let (x, y) = (TestNetwork::new("x"), TestNetwork::new("y"));
    let alice = TestNode::new("alice");
    let bob = TestNode::new("bob");
    join(&alice, &x, 1).await?;
    join(&bob, &y, 1).await?;

    let mut alice_events = alice.subscribe();
    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;

    assert!(
        wait_for_event(&mut alice_events, WAIT, |e| matches!(e, Event::NetworkNegotiationComplete { .. }))
            .await
            .is_some()
    );
    assert!(eventually(WAIT, || async { !conn.a_peer.is_syncing() }).await);
    assert!(conn.a_peer.network_keys().await.is_empty());
    assert_eq!(alice.host.peer_count(&x.key()), 0);
    Ok(())
}
