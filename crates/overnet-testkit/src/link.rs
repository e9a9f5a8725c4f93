//! In-process neighbor links.
//!
//! A `MemoryLink` is one side's view of a physical link: the neighbor's
//! identity, a port allocator, and its end of a duplex broker stream.
//! A `LoopbackPeerClient` delivers control messages straight into the
//! neighbor's `Peer`, waiting until that Peer has been registered.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use overnet_control::{
    AuthorityClient, AuthorityDialer, BrokerStream, HostId, NeighborLink, NetworkPeerClient, Peer,
    PeerClient,
};
use overnet_core::{Certificate, CertificateRequest, PeerMessage};
use tokio::io::DuplexStream;
use tokio::sync::watch;

const FIRST_PORT: u16 = 1000;
const BROKER_BUFFER: usize = 64 * 1024;

pub struct MemoryLink {
    host_id: HostId,
    certificate: Certificate,
    next_port: AtomicU16,
    reserved: AtomicUsize,
    stream: Mutex<Option<DuplexStream>>,
}

impl MemoryLink {
    /// One side of a link to a neighbor identified by `host_id` and `certificate`.
    pub fn new(host_id: HostId, certificate: Certificate, stream: DuplexStream) -> Self {
        Self {
            host_id,
            certificate,
            next_port: AtomicU16::new(FIRST_PORT),
            reserved: AtomicUsize::new(0),
            stream: Mutex::new(Some(stream)),
        }
    }

    /// Both ends of a link between `a` and `b`: the first is `a`'s view of `b`.
    pub fn pair(
        (a_id, a_cert): (HostId, Certificate),
        (b_id, b_cert): (HostId, Certificate),
    ) -> (Self, Self) {
        let (a_stream, b_stream) = tokio::io::duplex(BROKER_BUFFER);
        (
            Self::new(b_id, b_cert, a_stream),
            Self::new(a_id, a_cert, b_stream),
        )
    }

    /// How many ports have been reserved on this side.
    pub fn reserved_ports(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }
}

impl NeighborLink for MemoryLink {
    fn host_id(&self) -> HostId {
        self.host_id
    }

    fn certificate(&self) -> Certificate {
        self.certificate.clone()
    }

    fn reserve_port(&self) -> anyhow::Result<u16> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        if port == u16::MAX {
            return Err(anyhow!("port space exhausted"));
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(port)
    }

    fn broker_stream(&self) -> anyhow::Result<BrokerStream> {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("broker stream already taken")?;
        Ok(Box::new(stream))
    }
}

// ── Loopback RPC ──────────────────────────────────────────────────────────────

/// Sends control messages to the neighbor's Peer in-process.
pub struct LoopbackPeerClient {
    target: watch::Receiver<Option<Arc<Peer>>>,
    authority: RelayAuthority,
    sent: AtomicUsize,
}

/// Fills in the neighbor's Peer once it exists.
pub struct LoopbackTarget(watch::Sender<Option<Arc<Peer>>>);

impl LoopbackTarget {
    pub fn connect(&self, peer: Arc<Peer>) {
        self.0.send_replace(Some(peer));
    }
}

impl LoopbackPeerClient {
    /// `relay` is the neighbor's dialer: renewal requests sent through this
    /// client reach whatever authority the neighbor can reach.
    pub fn new(relay: Arc<dyn AuthorityDialer>) -> (Self, LoopbackTarget) {
        let (tx, rx) = watch::channel(None);
        let client = Self {
            target: rx,
            authority: RelayAuthority { dialer: relay },
            sent: AtomicUsize::new(0),
        };
        (client, LoopbackTarget(tx))
    }

    /// Control messages delivered so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    async fn target(&self) -> anyhow::Result<Arc<Peer>> {
        let mut rx = self.target.clone();
        let peer = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("neighbor went away"))?;
        peer.clone().context("neighbor went away")
    }
}

#[async_trait]
impl NetworkPeerClient for LoopbackPeerClient {
    async fn send(&self, message: PeerMessage) -> anyhow::Result<()> {
        let peer = self.target().await?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(peer = %peer.host_id(), kind = message.kind(), "loopback deliver");
        peer.handle_message(message).await?;
        Ok(())
    }
}

impl PeerClient for LoopbackPeerClient {
    fn network(&self) -> &dyn NetworkPeerClient {
        self
    }

    fn authority(&self) -> &dyn AuthorityClient {
        &self.authority
    }
}

/// The neighbor's authority proxy: forwards renewals to the authority the
/// neighbor can dial for the certificate's network.
pub struct RelayAuthority {
    dialer: Arc<dyn AuthorityDialer>,
}

#[async_trait]
impl AuthorityClient for RelayAuthority {
    async fn renew(
        &self,
        certificate: &Certificate,
        request: &CertificateRequest,
    ) -> anyhow::Result<Certificate> {
        let client = self.dialer.dial(&certificate.network_key()).await?;
        client.renew(certificate, request).await
    }
}
