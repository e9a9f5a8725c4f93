//! Collaborators the control plane consumes but does not own.
//!
//! The overlay host, the physical neighbor link, the RPC transport to a
//! neighbor, the private set intersection broker, and the certificate
//! authority are all reached through these traits. Each consumer gets the
//! narrow capability set it needs; one concrete adapter per deployment
//! implements them.
//!
//! Trait methods return `anyhow::Result`; Control wraps failures into
//! typed `ControlError`s at the call site.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use overnet_core::{
    Certificate, CertificateRequest, Network, NetworkKey, NetworkPeerBinding, PeerMessage,
};
use tokio::io::{AsyncRead, AsyncWrite};

// ── Host identity ─────────────────────────────────────────────────────────────

/// Overlay identity of a node. Totally ordered; negotiation tie-breaks on it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(pub [u8; 32]);

impl HostId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", hex::encode(self.0))
    }
}

// ── Overlay ───────────────────────────────────────────────────────────────────

/// The local overlay node: per-network routing and data-plane membership.
#[async_trait]
pub trait Host: Send + Sync {
    fn local_id(&self) -> HostId;

    /// Begin routing for `network`.
    async fn add_network(&self, network: &Network) -> anyhow::Result<()>;

    async fn remove_network(&self, key: &NetworkKey) -> anyhow::Result<()>;

    /// Swap the certificate the overlay presents for `network`.
    async fn update_certificate(&self, network: &Network) -> anyhow::Result<()>;

    /// Admit `peer` to the data plane of `key` over the given port pair.
    async fn add_peer(
        &self,
        key: &NetworkKey,
        peer: HostId,
        local_port: u16,
        peer_port: u16,
    ) -> anyhow::Result<()>;

    async fn remove_peer(&self, key: &NetworkKey, peer: HostId) -> anyhow::Result<()>;
}

/// Duplex byte stream reserved for the broker exchange with one neighbor.
pub trait BrokerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BrokerIo for T {}

pub type BrokerStream = Box<dyn BrokerIo>;

/// The physical link to one directly connected neighbor.
pub trait NeighborLink: Send + Sync {
    fn host_id(&self) -> HostId;

    /// Certificate the neighbor authenticated with when the link was set up.
    fn certificate(&self) -> Certificate;

    /// Reserve a fresh local data-channel port on this link.
    fn reserve_port(&self) -> anyhow::Result<u16>;

    /// Take the link's broker stream. Called once, when the Peer is created.
    fn broker_stream(&self) -> anyhow::Result<BrokerStream>;
}

// ── Broker ────────────────────────────────────────────────────────────────────

/// Two-party private set intersection over a neighbor's broker stream.
///
/// The sender learns nothing; the receiver learns which of its keys the
/// sender also holds. Neither side learns the other's non-matching keys.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn send_keys(&self, stream: &mut dyn BrokerIo, keys: &[NetworkKey]) -> anyhow::Result<()>;

    async fn receive_keys(
        &self,
        stream: &mut dyn BrokerIo,
        keys: &[NetworkKey],
    ) -> anyhow::Result<Vec<NetworkKey>>;
}

// ── Neighbor RPC ──────────────────────────────────────────────────────────────

/// Outbound half of a neighbor's control channel.
#[async_trait]
pub trait NetworkPeerClient: Send + Sync {
    /// Deliver one message and wait for its ack.
    async fn send(&self, message: PeerMessage) -> anyhow::Result<()>;

    async fn negotiate(&self, key_count: u32) -> anyhow::Result<()> {
        self.send(PeerMessage::Negotiate { key_count }).await
    }

    async fn open(&self, bindings: Vec<NetworkPeerBinding>) -> anyhow::Result<()> {
        self.send(PeerMessage::Open { bindings }).await
    }

    async fn close(&self, network_key: &NetworkKey) -> anyhow::Result<()> {
        self.send(PeerMessage::Close {
            network_key: network_key.clone(),
        })
        .await
    }

    async fn update_certificate(&self, certificate: &Certificate) -> anyhow::Result<()> {
        self.send(PeerMessage::UpdateCertificate {
            certificate: certificate.clone(),
        })
        .await
    }
}

/// A certificate authority, reached directly or relayed through a neighbor.
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Exchange the current certificate and a fresh request for a new certificate.
    async fn renew(
        &self,
        certificate: &Certificate,
        request: &CertificateRequest,
    ) -> anyhow::Result<Certificate>;
}

/// What Control and Peer need from a neighbor's RPC client.
pub trait PeerClient: Send + Sync {
    fn network(&self) -> &dyn NetworkPeerClient;

    /// The neighbor's authority proxy.
    fn authority(&self) -> &dyn AuthorityClient;
}

/// Opens an authenticated channel to a network's authority.
#[async_trait]
pub trait AuthorityDialer: Send + Sync {
    async fn dial(&self, key: &NetworkKey) -> anyhow::Result<Arc<dyn AuthorityClient>>;
}
