use crate::*;

use std::sync::Arc;

use overnet_control::MemoryNetworkStore;
use overnet_testkit::{connect, eventually, init_tracing, test_config, wait_for_event};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn updated(id: u64) -> impl FnMut(&Event) -> bool {
    move |event| matches!(event, Event::NetworkUpdate { network } if network.id == id)
}

// ── Provisional members ───────────────────────────────────────────────────────

/// An invitee whose own authority is unreachable renews through the
/// neighbor, then both sides open the binding.
#[tokio::test]
async fn provisional_member_upgrades_through_peer() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let alice = TestNode::new("alice");
    let bob_store = MemoryNetworkStore::new();
    let bob = TestNode::with_store("bob", test_config(), Arc::new(bob_store.clone()));

    alice.dialer.register(net.authority());
    alice
        .control
        .add(net.owner_network(1, &alice.profile.key, "alice"))
        .await?;
    join_provisional(&bob, &net, 1).await?;
    let key = net.key();
    assert!(!bob.control.certificate(&key).expect("bob cert").is_trusted());

    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;

    assert!(eventually(WAIT, || async {
        is_open(&conn.a_peer, &key).await && is_open(&conn.b_peer, &key).await
    })
    .await);

    let cert = bob.control.certificate(&key).expect("bob cert");
    assert!(cert.is_trusted());
    assert!(cert.is_owned_by(&bob.profile.key.public));
    assert_eq!(cert.subject, "bob");
    assert!(net.authority().requests() >= 1);

    // Everywhere at once: trust cache, overlay host, store.
    assert!(bob.control.certificates().get(&key).expect("entry").trusted);
    assert!(bob.host.network(&key).expect("routed").certificate.is_trusted());
    assert!(bob_store.get(1).expect("stored").certificate.is_trusted());

    assert!(eventually(WAIT, || async { bob.control.peer_count(1).await == Some(1) }).await);
    Ok(())
}

/// Without any route to the authority the binding is recorded but stays closed.
#[tokio::test]
async fn provisional_binding_stays_closed_without_authority() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let alice = TestNode::new("alice");
    let bob = TestNode::new("bob");
    join(&alice, &net, 1).await?;
    join_provisional(&bob, &net, 1).await?;

    alice.start();
    bob.start();
    let conn = connect(&alice, &bob, 1)?;
    let key = net.key();

    assert!(eventually(WAIT, || async {
        conn.a_peer.has_network_binding(&key).await && conn.b_peer.has_network_binding(&key).await
    })
    .await);

    let seen_by_alice = conn.a_peer.binding(&key).await.expect("alice binding");
    assert!(seen_by_alice.local_cert_trusted);
    assert!(!seen_by_alice.peer_cert_trusted);
    assert!(!seen_by_alice.open);

    let seen_by_bob = conn.b_peer.binding(&key).await.expect("bob binding");
    assert!(!seen_by_bob.local_cert_trusted);
    assert!(!seen_by_bob.open);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!is_open(&conn.a_peer, &key).await);
    assert!(alice.host.peer_ports(&key, bob.host_id).is_none());
    assert!(!bob.control.certificate(&key).expect("bob cert").is_trusted());
    Ok(())
}

// ── Scheduled renewal ─────────────────────────────────────────────────────────

/// A certificate inside the renewal lead is renewed on start; one outside
/// it is left alone.
#[tokio::test]
async fn renews_only_certificates_inside_lead() -> Result<()> {
    init_tracing();
    let (soon, later) = (TestNetwork::new("soon"), TestNetwork::new("later"));
    let node = TestNode::new("alice");
    node.dialer.register(soon.authority());
    node.dialer.register(later.authority());

    let expiring = soon.member_certificate_expiring_in(&node.profile.key, "alice", HOUR);
    let old_not_after = expiring.not_after;
    node.control.add(soon.network(1, expiring)).await?;
    let lasting = later.member_certificate_expiring_in(&node.profile.key, "alice", 30 * DAY);
    node.control.add(later.network(2, lasting.clone())).await?;

    let mut events = node.subscribe();
    node.start();

    let event = wait_for_event(&mut events, WAIT, updated(1)).await;
    assert!(event.is_some(), "network 1 was never renewed");

    let renewed = node.control.network(1).await.expect("network 1");
    assert!(renewed.certificate.not_after > old_not_after);
    assert_eq!(renewed.certificate.verify(), Ok(()));
    assert_eq!(soon.authority().requests(), 1);

    assert_eq!(later.authority().requests(), 0);
    let untouched = node.control.network(2).await.expect("network 2");
    assert_eq!(untouched.certificate, lasting);
    Ok(())
}

/// Changing the alternate profile name re-issues the certificate under the new subject.
#[tokio::test]
async fn alt_profile_name_triggers_renewal() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let node = TestNode::new("alice");
    node.dialer.register(net.authority());
    let cert = net.member_certificate_expiring_in(&node.profile.key, "alice", 30 * DAY);
    node.control.add(net.network(1, cert)).await?;

    node.start();
    let mut events = node.subscribe();
    node.control.set_alt_profile_name(1, "work").await?;

    let renewed = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, Event::NetworkUpdate { network } if network.certificate.subject == "work")
    })
    .await;
    assert!(renewed.is_some(), "no certificate issued for the new name");

    let network = node.control.network(1).await.expect("network");
    assert_eq!(network.alt_profile_name, "work");
    assert!(!network.is_subject_mismatched());
    assert_eq!(net.authority().requests(), 1);
    Ok(())
}

/// A failed renewal keeps the current certificate.
#[tokio::test]
async fn unreachable_authority_keeps_certificate() -> Result<()> {
    init_tracing();
    let net = TestNetwork::new("net");
    let node = TestNode::new("alice");
    let authority = net.authority();
    authority.set_unreachable(true);
    node.dialer.register(authority.clone());

    let cert = net.member_certificate_expiring_in(&node.profile.key, "alice", HOUR);
    let network = net.network(1, cert.clone());
    node.control.add(network.clone()).await?;

    let err = node.control.renew_certificate(&network).await.unwrap_err();
    assert!(matches!(err, overnet_control::ControlError::Authority(_)), "{err}");
    assert_eq!(authority.requests(), 1);
    assert_eq!(node.control.certificate(&net.key()), Some(cert));
    Ok(())
}
