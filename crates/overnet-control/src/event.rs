//! Event bus shared by Control, its Peers, and anything else on the node.
//!
//! Two broadcast channels. Global events are for every subsystem on the
//! node (network added/removed, certificate replaced); local events only
//! matter to the control plane and its observers (peer links opening,
//! negotiation progress). A local subscriber sees both; a global
//! subscriber sees only global events. Dropping a receiver unregisters it.
//!
//! There is no ambient instance: one `Observers` is built per node and
//! handed to Control, which hands it to each Peer.

use overnet_core::{Network, NetworkKey};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    PeerAdd {
        peer_id: u64,
    },
    PeerRemove {
        peer_id: u64,
    },
    NetworkAdd {
        network: Network,
    },
    NetworkRemove {
        network: Network,
    },
    NetworkStart {
        network: Network,
    },
    NetworkStop {
        network: Network,
    },
    /// The local certificate for `network` was replaced.
    NetworkCertUpdate {
        network: Network,
    },
    /// A negotiation with `peer_id` agreed on bindings for these networks.
    NetworkPeerBindings {
        peer_id: u64,
        network_keys: Vec<NetworkKey>,
    },
    NetworkPeerOpen {
        peer_id: u64,
        network_id: u64,
        network_key: NetworkKey,
    },
    NetworkPeerClose {
        peer_id: u64,
        network_id: u64,
        network_key: NetworkKey,
    },
    NetworkPeerCountUpdate {
        network_id: u64,
        peer_count: u32,
    },
    NetworkNegotiationComplete {
        peer_id: u64,
    },
    /// The stored record changed (certificate or alternate name).
    NetworkUpdate {
        network: Network,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PeerAdd { .. } => "peer_add",
            Event::PeerRemove { .. } => "peer_remove",
            Event::NetworkAdd { .. } => "network_add",
            Event::NetworkRemove { .. } => "network_remove",
            Event::NetworkStart { .. } => "network_start",
            Event::NetworkStop { .. } => "network_stop",
            Event::NetworkCertUpdate { .. } => "network_cert_update",
            Event::NetworkPeerBindings { .. } => "network_peer_bindings",
            Event::NetworkPeerOpen { .. } => "network_peer_open",
            Event::NetworkPeerClose { .. } => "network_peer_close",
            Event::NetworkPeerCountUpdate { .. } => "network_peer_count_update",
            Event::NetworkNegotiationComplete { .. } => "network_negotiation_complete",
            Event::NetworkUpdate { .. } => "network_update",
        }
    }
}

/// Externally visible network state changes, as produced by `Control::read_events`.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    NetworkStart { network: Network, peer_count: u32 },
    NetworkStop { network_id: u64 },
    NetworkPeerCountUpdate { network_id: u64, peer_count: u32 },
    NetworkUpdate { network: Network },
}

#[derive(Clone)]
pub struct Observers {
    global: broadcast::Sender<Event>,
    local: broadcast::Sender<Event>,
}

impl Observers {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        let (local, _) = broadcast::channel(capacity);
        Self { global, local }
    }

    /// Publish to every subscriber on the node.
    pub fn emit_global(&self, event: Event) {
        tracing::trace!(kind = event.kind(), "emit global");
        // No receivers is not an error.
        let _ = self.global.send(event.clone());
        let _ = self.local.send(event);
    }

    /// Publish to control-plane subscribers only.
    pub fn emit_local(&self, event: Event) {
        tracing::trace!(kind = event.kind(), "emit local");
        let _ = self.local.send(event);
    }

    /// Receive local and global events.
    pub fn subscribe_local(&self) -> broadcast::Receiver<Event> {
        self.local.subscribe()
    }

    /// Receive global events only.
    pub fn subscribe_global(&self) -> broadcast::Receiver<Event> {
        self.global.subscribe()
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new(128)
    }
}
