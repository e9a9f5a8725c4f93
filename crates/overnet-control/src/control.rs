//! Control: the per-node owner of networks, peers, and certificate renewal.
//!
//! One event loop per node processes events strictly in order. Anything
//! that talks to a neighbor or an authority (negotiation, renewal,
//! certificate pushes) is spawned off the loop so it never blocks on I/O.
//!
//! Locking: the network table is the Control-level lock. `add` and
//! `remove` hold it while touching peers so the two views stay consistent.
//! The peer map and trust cache have their own locks; each Peer guards
//! its own link table.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use overnet_core::certificate::unix_now;
use overnet_core::config::ControlConfig;
use overnet_core::{Certificate, CertificateRequest, KeyUsage, Network, NetworkKey, Profile};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, Result};
use crate::event::{Event, NetworkEvent, Observers};
use crate::interfaces::{
    AuthorityClient, AuthorityDialer, Broker, Host, NeighborLink, PeerClient,
};
use crate::peer::{Peer, PeerContext};
use crate::renewal::{is_renewal_due, RenewalSchedule};
use crate::store::NetworkStore;
use crate::trust::CertificateTrustCache;

/// External services a Control instance is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub host: Arc<dyn Host>,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn NetworkStore>,
    pub dialer: Arc<dyn AuthorityDialer>,
}

struct NetworkEntry {
    network: Network,
    peer_count: u32,
}

struct Networks {
    entries: BTreeMap<u64, NetworkEntry>,
    schedule: RenewalSchedule,
}

struct Inner {
    config: ControlConfig,
    profile: Profile,
    collaborators: Collaborators,
    observers: Observers,
    certificates: CertificateTrustCache,
    networks: Mutex<Networks>,
    peers: DashMap<u64, Arc<Peer>>,
    events: StdMutex<Option<broadcast::Receiver<Event>>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Control {
    inner: Arc<Inner>,
}

impl Control {
    /// Build a Control subscribed to `observers`. Nothing happens until `run`.
    pub fn new(
        config: ControlConfig,
        profile: Profile,
        observers: Observers,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let events = observers.subscribe_local();
        let schedule = RenewalSchedule::new(config.cert_renew_lead(), config.cert_recheck_interval());
        Self {
            inner: Arc::new(Inner {
                config,
                profile,
                collaborators,
                observers,
                certificates: CertificateTrustCache::new(),
                networks: Mutex::new(Networks {
                    entries: BTreeMap::new(),
                    schedule,
                }),
                peers: DashMap::new(),
                events: StdMutex::new(Some(events)),
                cancel,
            }),
        }
    }

    pub fn observers(&self) -> &Observers {
        &self.inner.observers
    }

    pub fn certificates(&self) -> &CertificateTrustCache {
        &self.inner.certificates
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    /// Load stored networks, then process events until cancelled.
    pub async fn run(&self) -> Result<()> {
        let mut events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ControlError::AlreadyRunning)?;

        self.start_networks().await?;

        loop {
            let deadline = self.renewal_deadline().await;

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                _ = sleep_until(deadline) => self.renew_expired_certificates().await,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "control event subscription lagged");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn start_networks(&self) -> Result<()> {
        let stored = self.inner.collaborators.store.load()?;
        let mut networks = self.inner.networks.lock().await;

        for network in stored {
            if networks.entries.contains_key(&network.id) {
                continue;
            }
            if let Err(e) = self.inner.collaborators.host.add_network(&network).await {
                tracing::error!(
                    name = %network.name,
                    network = %network.key().short(),
                    error = %e,
                    "starting network failed"
                );
                continue;
            }

            self.inner.certificates.insert(&network);
            tracing::info!(name = %network.name, network = %network.key().short(), "network started");
            self.inner.observers.emit_local(Event::NetworkStart {
                network: network.clone(),
            });
            networks.entries.insert(network.id, NetworkEntry { network, peer_count: 0 });
        }
        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::PeerAdd { peer_id } => {
                if let Some(peer) = self.peer(peer_id) {
                    self.spawn_sync(peer);
                }
            }
            Event::NetworkAdd { .. } => {
                // TODO: throttle when many peers are connected.
                for peer in self.peers() {
                    self.spawn_sync(peer);
                }
            }
            Event::NetworkPeerBindings { peer_id, network_keys } => {
                self.handle_peer_bindings(peer_id, &network_keys).await;
            }
            Event::NetworkCertUpdate { network } => self.push_certificate(network),
            Event::NetworkPeerOpen { network_id, .. } => {
                self.update_peer_count(network_id, 1).await;
            }
            Event::NetworkPeerClose { network_id, .. } => {
                self.update_peer_count(network_id, -1).await;
            }
            _ => {}
        }
    }

    fn spawn_sync(&self, peer: Arc<Peer>) {
        let observers = self.inner.observers.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.sync(&cancel).await {
                tracing::debug!(peer = %peer.host_id(), error = %e, "network negotiation failed");
            }
            observers.emit_local(Event::NetworkNegotiationComplete { peer_id: peer.id() });
        });
    }

    /// Ask the neighbor to relay renewal for every shared network we only
    /// hold a provisional certificate for.
    async fn handle_peer_bindings(&self, peer_id: u64, keys: &[NetworkKey]) {
        let Some(peer) = self.peer(peer_id) else {
            return;
        };
        let networks = self.inner.networks.lock().await;

        for key in keys {
            let Some(entry) = self.inner.certificates.get(key) else {
                continue;
            };
            if entry.trusted {
                continue;
            }
            let Some(network) = networks.entries.get(&entry.network_id) else {
                continue;
            };

            let this = self.clone();
            let peer = Arc::clone(&peer);
            let network = network.network.clone();
            tokio::spawn(async move {
                if let Err(e) = this.renew_certificate_with_peer(&network, &peer).await {
                    tracing::debug!(
                        peer = %peer.host_id(),
                        network = %network.key().short(),
                        error = %e,
                        "certificate renew via peer failed"
                    );
                }
            });
        }
    }

    /// Send a replaced certificate to every neighbor holding a binding for it.
    fn push_certificate(&self, network: Network) {
        let key = network.key();
        for peer in self.peers() {
            let network = network.clone();
            let key = key.clone();
            tokio::spawn(async move {
                if !peer.has_network_binding(&key).await {
                    return;
                }
                if let Err(e) = peer.send_certificate_update(&network).await {
                    tracing::debug!(
                        peer = %peer.host_id(),
                        network = %key.short(),
                        error = %e,
                        "certificate update failed"
                    );
                }
            });
        }
    }

    async fn update_peer_count(&self, network_id: u64, delta: i32) {
        let mut networks = self.inner.networks.lock().await;
        let Some(entry) = networks.entries.get_mut(&network_id) else {
            return;
        };
        entry.peer_count = entry.peer_count.saturating_add_signed(delta);
        self.inner.observers.emit_local(Event::NetworkPeerCountUpdate {
            network_id,
            peer_count: entry.peer_count,
        });
    }

    // ── Renewal ───────────────────────────────────────────────────────────────

    async fn renewal_deadline(&self) -> Option<u64> {
        let networks = self.inner.networks.lock().await;
        networks
            .schedule
            .deadline(networks.entries.values().map(|e| &e.network), unix_now())
    }

    async fn renew_expired_certificates(&self) {
        let now = unix_now();
        let due: Vec<Network> = {
            let mut networks = self.inner.networks.lock().await;
            networks.schedule.mark_swept(now);
            let lead = networks.schedule.lead();
            networks
                .entries
                .values()
                .filter(|e| is_renewal_due(&e.network, lead, now))
                .map(|e| e.network.clone())
                .collect()
        };

        for network in due {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.renew_certificate(&network).await {
                    tracing::debug!(
                        network = %network.key().short(),
                        error = %e,
                        "network certificate renewal failed"
                    );
                }
            });
        }
    }

    /// Renew directly with the network's authority.
    pub async fn renew_certificate(&self, network: &Network) -> Result<()> {
        let client = self
            .inner
            .collaborators
            .dialer
            .dial(&network.key())
            .await
            .map_err(ControlError::Authority)?;
        self.renew_with(network, client.as_ref()).await
    }

    /// Renew through a neighbor's authority proxy.
    pub async fn renew_certificate_with_peer(&self, network: &Network, peer: &Peer) -> Result<()> {
        self.renew_with(network, peer.client().authority()).await
    }

    async fn renew_with(&self, network: &Network, authority: &dyn AuthorityClient) -> Result<()> {
        let profile = &self.inner.profile;
        let csr = CertificateRequest::new(
            &profile.key,
            KeyUsage::PEER | KeyUsage::SIGN,
            network.certificate_subject(profile),
        );

        let renewal = tokio::time::timeout(
            self.inner.config.renew_timeout(),
            authority.renew(&network.certificate, &csr),
        );
        let certificate = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(ControlError::Cancelled),
            res = renewal => res
                .map_err(|_| ControlError::Timeout("certificate renewal"))?
                .map_err(ControlError::Authority)?,
        };

        certificate.verify()?;
        if !certificate.is_owned_by(&profile.key.public) {
            return Err(ControlError::NetworkOwnerMismatch);
        }
        if certificate.network_key() != network.key() {
            return Err(ControlError::NetworkAuthorityMismatch);
        }

        self.set_certificate(network.id, certificate).await
    }

    /// Swap in a new certificate everywhere at once: store, trust cache,
    /// overlay. Readers see either the old chain or the new one.
    async fn set_certificate(&self, id: u64, certificate: Certificate) -> Result<()> {
        let mut networks = self.inner.networks.lock().await;
        let entry = networks
            .entries
            .get_mut(&id)
            .ok_or(ControlError::NetworkNotFound)?;

        let mut updated = entry.network.clone();
        updated.certificate = certificate;
        self.inner.collaborators.store.save(&updated)?;
        if let Err(e) = self.inner.collaborators.host.update_certificate(&updated).await {
            self.restore_stored(id, Some(&entry.network));
            return Err(ControlError::Host(e));
        }
        self.inner.certificates.insert(&updated);
        entry.network = updated.clone();

        tracing::info!(
            network = %updated.key().short(),
            trusted = updated.certificate.is_trusted(),
            not_after = updated.certificate.not_after,
            "network certificate replaced"
        );
        self.inner.observers.emit_global(Event::NetworkCertUpdate {
            network: updated.clone(),
        });
        self.inner
            .observers
            .emit_local(Event::NetworkUpdate { network: updated });
        Ok(())
    }

    /// Override the certificate subject for one network. A mismatch with the
    /// current certificate makes renewal due on the next sweep.
    pub async fn set_alt_profile_name(&self, id: u64, name: impl Into<String>) -> Result<()> {
        let mut networks = self.inner.networks.lock().await;
        let entry = networks
            .entries
            .get_mut(&id)
            .ok_or(ControlError::NetworkNotFound)?;

        let mut updated = entry.network.clone();
        updated.alt_profile_name = name.into();
        self.inner.collaborators.store.save(&updated)?;
        entry.network = updated.clone();

        self.inner
            .observers
            .emit_local(Event::NetworkUpdate { network: updated });
        Ok(())
    }

    /// Put the stored record back after the overlay refused a change.
    /// `None` means there was no record before.
    fn restore_stored(&self, id: u64, previous: Option<&Network>) {
        let store = &self.inner.collaborators.store;
        let restored = match previous {
            Some(network) => store.save(network),
            None => store.delete(id),
        };
        if let Err(e) = restored {
            tracing::warn!(network_id = id, error = %e, "failed to roll back stored network");
        }
    }

    // ── Networks ──────────────────────────────────────────────────────────────

    pub async fn add(&self, network: Network) -> Result<()> {
        let mut networks = self.inner.networks.lock().await;
        if networks.entries.contains_key(&network.id) {
            return Err(ControlError::DuplicateNetwork(network.id));
        }

        self.inner.collaborators.store.save(&network)?;
        if let Err(e) = self.inner.collaborators.host.add_network(&network).await {
            self.restore_stored(network.id, None);
            return Err(ControlError::Host(e));
        }
        self.inner.certificates.insert(&network);
        networks.entries.insert(
            network.id,
            NetworkEntry {
                network: network.clone(),
                peer_count: 0,
            },
        );

        tracing::info!(name = %network.name, network = %network.key().short(), "network added");
        self.inner.observers.emit_global(Event::NetworkAdd {
            network: network.clone(),
        });
        self.inner.observers.emit_local(Event::NetworkStart { network });
        Ok(())
    }

    pub async fn remove(&self, id: u64) -> Result<()> {
        let mut networks = self.inner.networks.lock().await;
        let network = networks
            .entries
            .get(&id)
            .map(|e| e.network.clone())
            .ok_or(ControlError::NetworkNotFound)?;
        let key = network.key();

        self.inner.collaborators.store.delete(id)?;
        if let Err(e) = self.inner.collaborators.host.remove_network(&key).await {
            self.restore_stored(id, Some(&network));
            return Err(ControlError::Host(e));
        }

        for peer in self.peers() {
            match peer.close_binding(&key).await {
                Ok(()) => {
                    let key = key.clone();
                    tokio::spawn(async move {
                        if let Err(e) = peer.client().network().close(&key).await {
                            tracing::debug!(peer = %peer.host_id(), error = %e, "close notification failed");
                        }
                    });
                }
                Err(ControlError::NetworkBindingNotFound) => {}
                Err(e) => {
                    tracing::debug!(peer = %peer.host_id(), network = %key.short(), error = %e, "closing binding failed");
                }
            }
        }

        self.inner.certificates.delete(&key);
        networks.entries.remove(&id);

        tracing::info!(name = %network.name, network = %key.short(), "network removed");
        self.inner.observers.emit_global(Event::NetworkRemove {
            network: network.clone(),
        });
        self.inner.observers.emit_local(Event::NetworkStop { network });
        Ok(())
    }

    /// The active certificate for the network identified by `key`.
    pub fn certificate(&self, key: &NetworkKey) -> Option<Certificate> {
        self.inner.certificates.get(key).map(|e| e.certificate)
    }

    pub async fn network(&self, id: u64) -> Option<Network> {
        let networks = self.inner.networks.lock().await;
        networks.entries.get(&id).map(|e| e.network.clone())
    }

    pub async fn peer_count(&self, id: u64) -> Option<u32> {
        let networks = self.inner.networks.lock().await;
        networks.entries.get(&id).map(|e| e.peer_count)
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    /// Register a newly connected neighbor. Negotiation starts from the
    /// event loop once it sees the `PeerAdd`.
    pub fn add_peer(
        &self,
        id: u64,
        link: Arc<dyn NeighborLink>,
        client: Arc<dyn PeerClient>,
    ) -> Result<Arc<Peer>> {
        let ctx = PeerContext {
            observers: self.inner.observers.clone(),
            broker: Arc::clone(&self.inner.collaborators.broker),
            host: Arc::clone(&self.inner.collaborators.host),
            certificates: self.inner.certificates.clone(),
            negotiation_timeout: self.inner.config.negotiation_timeout(),
            expiry_grace: self.inner.config.expiry_grace(),
        };
        let peer = Arc::new(Peer::new(
            id,
            link,
            client,
            ctx,
            self.inner.cancel.child_token(),
        )?);

        tracing::debug!(peer = %peer.host_id(), peer_id = id, "peer added");
        self.inner.peers.insert(id, Arc::clone(&peer));
        self.inner.observers.emit_local(Event::PeerAdd { peer_id: id });
        Ok(peer)
    }

    /// Forget a disconnected neighbor after tearing down its bindings.
    pub async fn remove_peer(&self, id: u64) {
        let Some((_, peer)) = self.inner.peers.remove(&id) else {
            return;
        };
        peer.close().await;
        tracing::debug!(peer = %peer.host_id(), peer_id = id, "peer removed");
        self.inner.observers.emit_local(Event::PeerRemove { peer_id: id });
    }

    pub fn peer(&self, id: u64) -> Option<Arc<Peer>> {
        self.inner.peers.get(&id).map(|p| Arc::clone(p.value()))
    }

    fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner
            .peers
            .iter()
            .map(|p| Arc::clone(p.value()))
            .collect()
    }

    // ── Observers ─────────────────────────────────────────────────────────────

    /// Current state followed by live changes, until `cancel` fires.
    ///
    /// Starts with one `NetworkStart` per known network, so a late
    /// subscriber sees everything. Each call is an independent subscription.
    pub async fn read_events(&self, cancel: CancellationToken) -> ReceiverStream<NetworkEvent> {
        let (tx, rx) = mpsc::channel(8);
        let mut events = self.inner.observers.subscribe_local();

        let snapshot: Vec<NetworkEvent> = {
            let networks = self.inner.networks.lock().await;
            networks
                .entries
                .values()
                .map(|e| NetworkEvent::NetworkStart {
                    network: e.network.clone(),
                    peer_count: e.peer_count,
                })
                .collect()
        };

        tokio::spawn(async move {
            for event in snapshot {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(event) => if sent.is_err() { return },
                }
            }

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let out = match event {
                    Ok(Event::NetworkStart { network }) => NetworkEvent::NetworkStart {
                        network,
                        peer_count: 0,
                    },
                    Ok(Event::NetworkStop { network }) => NetworkEvent::NetworkStop {
                        network_id: network.id,
                    },
                    Ok(Event::NetworkPeerCountUpdate {
                        network_id,
                        peer_count,
                    }) => NetworkEvent::NetworkPeerCountUpdate {
                        network_id,
                        peer_count,
                    },
                    Ok(Event::NetworkUpdate { network }) => NetworkEvent::NetworkUpdate { network },
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "network event subscription lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(out) => if sent.is_err() { return },
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

/// Sleep until a unix-seconds deadline; never wakes if there is none.
async fn sleep_until(deadline: Option<u64>) {
    let at = deadline.and_then(|deadline| {
        let wait = Duration::from_secs(deadline.saturating_sub(unix_now()));
        Instant::now().checked_add(wait)
    });
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending::<()>().await,
    }
}
