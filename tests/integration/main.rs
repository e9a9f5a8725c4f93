//! Overnet integration test harness.
//!
//! Every test builds complete nodes in-process: Control wired to the
//! testkit's memory host, hash broker, loopback links and authorities.
//! No sockets, no privileges.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=overnet_control=debug to watch negotiations.

use std::time::Duration;

use anyhow::Result;
use overnet_control::{Event, Peer};
use overnet_core::{Network, NetworkKey};
use overnet_testkit::{TestNetwork, TestNode};

mod certificates;
mod lifecycle;
mod negotiation;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait. Generous: negotiation rounds that lose
/// a race only end at the two-second negotiation timeout.
pub const WAIT: Duration = Duration::from_secs(10);

/// Add a trusted membership in `net` to `node` under local id `id`.
pub async fn join(node: &TestNode, net: &TestNetwork, id: u64) -> Result<Network> {
    let certificate = net.member_certificate(&node.profile.key, &node.profile.name);
    let network = net.network(id, certificate);
    node.control.add(network.clone()).await?;
    Ok(network)
}

/// Add a provisional (invited, not yet renewed) membership.
pub async fn join_provisional(node: &TestNode, net: &TestNetwork, id: u64) -> Result<Network> {
    let certificate = net.provisional_certificate(&node.profile.key, &node.profile.name);
    let network = net.network(id, certificate);
    node.control.add(network.clone()).await?;
    Ok(network)
}

pub async fn is_open(peer: &Peer, key: &NetworkKey) -> bool {
    peer.binding(key).await.is_some_and(|b| b.open)
}

pub fn opened(key: &NetworkKey) -> impl FnMut(&Event) -> bool + '_ {
    move |event| matches!(event, Event::NetworkPeerOpen { network_key, .. } if network_key == key)
}
