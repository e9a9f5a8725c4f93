//! Peer: negotiation with one directly connected neighbor.
//!
//! A negotiation run:
//!   1. Both sides announce how many networks they know (`Negotiate`).
//!   2. The side with more keys receives the set intersection, the side
//!      with fewer sends; equal counts tie-break on host id.
//!   3. The broker computes the intersection over the broker stream.
//!   4. Both sides exchange `Open` bindings (port + certificate) for the
//!      shared networks and reconcile them position by position.
//!
//! A binding opens a data channel only when both certificates are
//! first-level members of the network. Provisional bindings are kept so a
//! later `UpdateCertificate` can open them without renegotiating.
//!
//! Only one run per Peer at a time; a second attempt fails immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use overnet_core::certificate::unix_now;
use overnet_core::{
    Certificate, CertificateError, Network, NetworkKey, NetworkPeerBinding, PeerMessage,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, Result};
use crate::event::{Event, Observers};
use crate::interfaces::{Broker, BrokerStream, Host, HostId, NeighborLink, PeerClient};
use crate::mailbox::Mailbox;
use crate::trust::CertificateTrustCache;

// ── Roles ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Feeds its keys into the broker and learns the intersection from the
    /// neighbor's bindings.
    Sender,
    /// Learns the intersection from the broker and offers bindings first.
    Receiver,
}

/// Both sides evaluate this from their own perspective and must land on
/// complementary roles.
pub fn select_role(local_count: usize, peer_count: usize, local_id: HostId, peer_id: HostId) -> Role {
    match local_count.cmp(&peer_count) {
        std::cmp::Ordering::Greater => Role::Receiver,
        std::cmp::Ordering::Less => Role::Sender,
        std::cmp::Ordering::Equal if local_id < peer_id => Role::Sender,
        std::cmp::Ordering::Equal => Role::Receiver,
    }
}

// ── Bindings ──────────────────────────────────────────────────────────────────

/// One network's data channel over this neighbor's link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    pub network_id: u64,
    pub local_port: u16,
    pub peer_port: u16,
    pub local_cert_trusted: bool,
    pub peer_cert_trusted: bool,
    pub open: bool,
}

#[derive(Default)]
struct LinkTable {
    bindings: BTreeMap<NetworkKey, NetworkBinding>,
    /// Trusted certificate updates that arrived before the binding was
    /// recorded; applied when reconciliation catches up.
    early_upgrades: BTreeSet<NetworkKey>,
}

/// Check every certificate the neighbor offered and return the network key
/// of each binding, in the order received.
///
/// A chain whose only defect is an expired `NotAfter` is tolerated. With a
/// `grace`, the tolerance ends `grace` after the earliest expiry in the chain.
pub fn verify_network_bindings(
    bindings: &[NetworkPeerBinding],
    now: u64,
    grace: Option<Duration>,
) -> Result<Vec<NetworkKey>> {
    if bindings.is_empty() {
        return Err(ControlError::NetworkBindingsEmpty);
    }

    bindings
        .iter()
        .map(|binding| {
            if let Err(errs) = binding.certificate.verify_at(now) {
                if !errs.includes_only(CertificateError::NotAfterRange) {
                    return Err(errs.into());
                }
                if let Some(grace) = grace {
                    let limit = binding
                        .certificate
                        .earliest_not_after()
                        .saturating_add(grace.as_secs());
                    if now > limit {
                        return Err(errs.into());
                    }
                }
            }
            Ok(binding.certificate.network_key())
        })
        .collect()
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// Node-wide state every Peer shares with Control.
#[derive(Clone)]
pub(crate) struct PeerContext {
    pub observers: Observers,
    pub broker: Arc<dyn Broker>,
    pub host: Arc<dyn Host>,
    pub certificates: CertificateTrustCache,
    pub negotiation_timeout: Duration,
    pub expiry_grace: Option<Duration>,
}

pub struct Peer {
    id: u64,
    link: Arc<dyn NeighborLink>,
    client: Arc<dyn PeerClient>,
    ctx: PeerContext,
    cancel: CancellationToken,

    links: Mutex<LinkTable>,
    syncing: AtomicBool,
    key_count: Mailbox<u32>,
    bindings: Mailbox<Vec<NetworkPeerBinding>>,
    broker_stream: Mutex<BrokerStream>,
}

/// Holds the per-peer negotiation flag; released on every exit path.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Peer {
    pub(crate) fn new(
        id: u64,
        link: Arc<dyn NeighborLink>,
        client: Arc<dyn PeerClient>,
        ctx: PeerContext,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let broker_stream = link.broker_stream().map_err(ControlError::Host)?;
        Ok(Self {
            id,
            link,
            client,
            ctx,
            cancel,
            links: Mutex::new(LinkTable::default()),
            syncing: AtomicBool::new(false),
            key_count: Mailbox::new(),
            bindings: Mailbox::new(),
            broker_stream: Mutex::new(broker_stream),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host_id(&self) -> HostId {
        self.link.host_id()
    }

    pub fn client(&self) -> &dyn PeerClient {
        self.client.as_ref()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn binding(&self, key: &NetworkKey) -> Option<NetworkBinding> {
        self.links.lock().await.bindings.get(key).cloned()
    }

    pub async fn has_network_binding(&self, key: &NetworkKey) -> bool {
        self.links.lock().await.bindings.contains_key(key)
    }

    pub async fn network_keys(&self) -> Vec<NetworkKey> {
        self.links.lock().await.bindings.keys().cloned().collect()
    }

    // ── Negotiation ───────────────────────────────────────────────────────────

    /// Run one negotiation with this neighbor, bounded by the negotiation
    /// timeout and aborted if `cancel` fires.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = SyncGuard::acquire(&self.syncing).ok_or(ControlError::AlreadySyncing)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(ControlError::Cancelled),
            _ = self.cancel.cancelled() => Err(ControlError::Cancelled),
            res = tokio::time::timeout(self.ctx.negotiation_timeout, self.negotiate()) => {
                res.unwrap_or(Err(ControlError::Timeout("network negotiation")))
            }
        }
    }

    async fn negotiate(&self) -> Result<()> {
        // Bindings left over from an aborted run cannot belong to this one:
        // the neighbor only sends them after seeing our init.
        let _ = self.bindings.take();

        let keys = self.ctx.certificates.keys();
        let key_count = u32::try_from(keys.len()).unwrap_or(u32::MAX);
        self.client
            .network()
            .negotiate(key_count)
            .await
            .map_err(ControlError::Transport)?;

        let peer_count = self.key_count.recv().await;
        if keys.is_empty() || peer_count == 0 {
            return Err(ControlError::EmptyKeySet);
        }

        let role = select_role(
            keys.len(),
            peer_count as usize,
            self.ctx.host.local_id(),
            self.host_id(),
        );
        tracing::debug!(
            peer = %self.host_id(),
            local_keys = keys.len(),
            peer_keys = peer_count,
            ?role,
            "negotiating networks"
        );

        match role {
            Role::Sender => self.exchange_as_sender(&keys).await,
            Role::Receiver => self.exchange_as_receiver(&keys).await,
        }
    }

    async fn exchange_as_receiver(&self, keys: &[NetworkKey]) -> Result<()> {
        let shared = {
            let mut stream = self.broker_stream.lock().await;
            self.ctx
                .broker
                .receive_keys(&mut **stream, keys)
                .await
                .map_err(ControlError::Broker)?
        };
        let local = self.send_network_bindings(&shared).await?;

        let peer = self.bindings.recv().await;
        self.verify_network_bindings(&peer)?;
        self.handle_network_bindings(&local, &peer).await?;

        self.emit_bindings(shared);
        Ok(())
    }

    async fn exchange_as_sender(&self, keys: &[NetworkKey]) -> Result<()> {
        {
            let mut stream = self.broker_stream.lock().await;
            self.ctx
                .broker
                .send_keys(&mut **stream, keys)
                .await
                .map_err(ControlError::Broker)?;
        }

        let peer = self.bindings.recv().await;
        let shared = self.verify_network_bindings(&peer)?;
        let local = self.send_network_bindings(&shared).await?;
        self.handle_network_bindings(&local, &peer).await?;

        self.emit_bindings(shared);
        Ok(())
    }

    fn emit_bindings(&self, network_keys: Vec<NetworkKey>) {
        self.ctx.observers.emit_local(Event::NetworkPeerBindings {
            peer_id: self.id,
            network_keys,
        });
    }

    /// Offer bindings for every key in `keys` not already bound on this
    /// link, reserving one fresh local port each. Returns what was sent.
    pub async fn send_network_bindings(&self, keys: &[NetworkKey]) -> Result<Vec<NetworkPeerBinding>> {
        let mut bindings = Vec::with_capacity(keys.len());
        {
            let links = self.links.lock().await;
            for key in keys {
                let entry = self
                    .ctx
                    .certificates
                    .get(key)
                    .ok_or(ControlError::NetworkNotFound)?;
                if links.bindings.contains_key(key) {
                    continue;
                }
                let port = self.link.reserve_port().map_err(ControlError::Host)?;
                bindings.push(NetworkPeerBinding {
                    port: u32::from(port),
                    certificate: entry.certificate,
                });
            }
        }

        self.client
            .network()
            .open(bindings.clone())
            .await
            .map_err(ControlError::Transport)?;
        Ok(bindings)
    }

    pub fn verify_network_bindings(&self, bindings: &[NetworkPeerBinding]) -> Result<Vec<NetworkKey>> {
        verify_network_bindings(bindings, unix_now(), self.ctx.expiry_grace)
    }

    /// Reconcile what we sent with what the neighbor sent, position by position.
    pub async fn handle_network_bindings(
        &self,
        local: &[NetworkPeerBinding],
        peer: &[NetworkPeerBinding],
    ) -> Result<()> {
        if local.len() != peer.len() {
            return Err(ControlError::BindingCountMismatch {
                local: local.len(),
                peer: peer.len(),
            });
        }

        let identity = self.link.certificate();
        let mut links = self.links.lock().await;

        for (binding, peer_binding) in local.iter().zip(peer) {
            let network_key = peer_binding.certificate.network_key();

            if !peer_binding.certificate.is_owned_by(&identity.key) {
                return Err(ControlError::NetworkOwnerMismatch);
            }
            if binding.certificate.network_key() != network_key {
                return Err(ControlError::NetworkAuthorityMismatch);
            }
            let peer_port = u16::try_from(peer_binding.port)
                .map_err(|_| ControlError::NetworkIDBounds(peer_binding.port))?;
            let local_port = u16::try_from(binding.port)
                .map_err(|_| ControlError::NetworkIDBounds(binding.port))?;

            // Removed while we were negotiating.
            let Some(entry) = self.ctx.certificates.get(&network_key) else {
                continue;
            };

            let upgraded = links.early_upgrades.remove(&network_key);
            links.bindings.insert(
                network_key.clone(),
                NetworkBinding {
                    network_id: entry.network_id,
                    local_port,
                    peer_port,
                    local_cert_trusted: binding.certificate.is_trusted(),
                    peer_cert_trusted: peer_binding.certificate.is_trusted() || upgraded,
                    open: false,
                },
            );
            if let Some(link) = links.bindings.get_mut(&network_key) {
                self.open_binding(&network_key, link).await?;
            }
        }
        Ok(())
    }

    /// Admit the neighbor to the network's data plane once both sides are trusted.
    async fn open_binding(&self, key: &NetworkKey, link: &mut NetworkBinding) -> Result<()> {
        if link.open || !link.local_cert_trusted || !link.peer_cert_trusted {
            return Ok(());
        }

        self.ctx
            .host
            .add_peer(key, self.host_id(), link.local_port, link.peer_port)
            .await
            .map_err(ControlError::Host)?;
        link.open = true;

        tracing::info!(
            peer = %self.host_id(),
            network = %key.short(),
            local_port = link.local_port,
            peer_port = link.peer_port,
            "adding peer to network"
        );
        self.ctx.observers.emit_local(Event::NetworkPeerOpen {
            peer_id: self.id,
            network_id: link.network_id,
            network_key: key.clone(),
        });
        Ok(())
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    /// Drop the binding for `key` without telling the neighbor. The
    /// physical link stays up.
    pub async fn close_binding(&self, key: &NetworkKey) -> Result<()> {
        let mut links = self.links.lock().await;
        links.early_upgrades.remove(key);
        let link = links
            .bindings
            .remove(key)
            .ok_or(ControlError::NetworkBindingNotFound)?;

        if link.open {
            self.ctx
                .host
                .remove_peer(key, self.host_id())
                .await
                .map_err(ControlError::Host)?;

            tracing::info!(peer = %self.host_id(), network = %key.short(), "removed peer from network");
            self.ctx.observers.emit_local(Event::NetworkPeerClose {
                peer_id: self.id,
                network_id: link.network_id,
                network_key: key.clone(),
            });
        }
        Ok(())
    }

    /// Drop the binding locally and ask the neighbor to do the same.
    pub async fn close_network(&self, key: &NetworkKey) {
        match self.close_binding(key).await {
            Ok(()) | Err(ControlError::NetworkBindingNotFound) => {}
            Err(e) => {
                tracing::debug!(peer = %self.host_id(), network = %key.short(), error = %e, "closing binding failed");
            }
        }
        if let Err(e) = self.client.network().close(key).await {
            tracing::debug!(peer = %self.host_id(), network = %key.short(), error = %e, "close notification failed");
        }
    }

    /// Tear down every binding on this link. Used when the neighbor disconnects.
    pub async fn close(&self) {
        self.cancel.cancel();
        for key in self.network_keys().await {
            if let Err(e) = self.close_binding(&key).await {
                tracing::debug!(peer = %self.host_id(), network = %key.short(), error = %e, "closing binding failed");
            }
        }
    }

    // ── Certificate updates ───────────────────────────────────────────────────

    /// Tell the neighbor our certificate for `network` changed, then open
    /// the binding if that made both sides trusted.
    pub async fn send_certificate_update(&self, network: &Network) -> Result<()> {
        let key = network.key();
        {
            let mut links = self.links.lock().await;
            let link = links
                .bindings
                .get_mut(&key)
                .ok_or(ControlError::NetworkBindingNotFound)?;
            link.local_cert_trusted = network.certificate.is_trusted();
        }

        self.client
            .network()
            .update_certificate(&network.certificate)
            .await
            .map_err(ControlError::Transport)?;

        let mut links = self.links.lock().await;
        match links.bindings.get_mut(&key) {
            Some(link) => self.open_binding(&key, link).await,
            None => Err(ControlError::NetworkBindingNotFound),
        }
    }

    // ── Incoming control messages ─────────────────────────────────────────────

    pub async fn handle_message(self: &Arc<Self>, message: PeerMessage) -> Result<()> {
        tracing::trace!(peer = %self.host_id(), kind = message.kind(), "peer message");
        match message {
            PeerMessage::Negotiate { key_count } => {
                self.handle_negotiate(key_count);
                Ok(())
            }
            PeerMessage::Open { bindings } => {
                self.handle_open(bindings);
                Ok(())
            }
            PeerMessage::Close { network_key } => self.handle_close(&network_key).await,
            PeerMessage::UpdateCertificate { certificate } => {
                self.handle_update_certificate(certificate).await
            }
        }
    }

    /// The neighbor started a negotiation; join it unless one is running.
    pub fn handle_negotiate(self: &Arc<Self>, key_count: u32) {
        self.key_count.put(key_count);

        if self.is_syncing() {
            return;
        }
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = peer.sync(&peer.cancel).await {
                tracing::debug!(peer = %peer.host_id(), error = %e, "network negotiation failed");
            }
        });
    }

    pub fn handle_open(&self, bindings: Vec<NetworkPeerBinding>) {
        self.bindings.put(bindings);
    }

    pub async fn handle_close(&self, key: &NetworkKey) -> Result<()> {
        self.close_binding(key).await
    }

    /// The neighbor's certificate for a shared network was upgraded.
    pub async fn handle_update_certificate(&self, certificate: Certificate) -> Result<()> {
        let result = self.apply_certificate_update(&certificate).await;
        if let Err(e) = &result {
            tracing::debug!(peer = %self.host_id(), error = %e, "update certificate failed");
        }
        result
    }

    async fn apply_certificate_update(&self, certificate: &Certificate) -> Result<()> {
        certificate.verify()?;
        if !certificate.is_owned_by(&self.link.certificate().key) {
            return Err(ControlError::NetworkOwnerMismatch);
        }
        if !certificate.is_trusted() {
            return Err(ControlError::ProvisionalCertificate);
        }

        let key = certificate.network_key();
        if self.ctx.certificates.get(&key).is_none() {
            return Err(ControlError::NetworkNotFound);
        }

        let mut links = self.links.lock().await;
        match links.bindings.get_mut(&key) {
            Some(link) => {
                link.peer_cert_trusted = true;
                self.open_binding(&key, link).await
            }
            None if self.is_syncing() => {
                links.early_upgrades.insert(key);
                Ok(())
            }
            None => Err(ControlError::NetworkBindingNotFound),
        }
    }
}
