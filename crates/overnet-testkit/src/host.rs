//! In-memory overlay host: records which networks are routed and which
//! neighbors sit in each network's data plane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;
use overnet_control::{Host, HostId};
use overnet_core::{Network, NetworkKey};

#[derive(Clone)]
pub struct MemoryHost {
    id: HostId,
    networks: Arc<DashMap<NetworkKey, Network>>,
    peers: Arc<DashMap<(NetworkKey, HostId), (u16, u16)>>,
    failing: Arc<AtomicBool>,
}

impl MemoryHost {
    pub fn new(id: HostId) -> Self {
        Self {
            id,
            networks: Arc::new(DashMap::new()),
            peers: Arc::new(DashMap::new()),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Refuse every subsequent network change (add, remove, certificate
    /// swap) as a broken overlay would. Peer bindings are unaffected.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("overlay host unavailable");
        }
        Ok(())
    }

    pub fn has_network(&self, key: &NetworkKey) -> bool {
        self.networks.contains_key(key)
    }

    pub fn network(&self, key: &NetworkKey) -> Option<Network> {
        self.networks.get(key).map(|n| n.value().clone())
    }

    /// Local and peer port of `peer` in `key`'s data plane.
    pub fn peer_ports(&self, key: &NetworkKey, peer: HostId) -> Option<(u16, u16)> {
        self.peers.get(&(key.clone(), peer)).map(|p| *p.value())
    }

    pub fn peer_count(&self, key: &NetworkKey) -> usize {
        self.peers.iter().filter(|e| &e.key().0 == key).count()
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_id(&self) -> HostId {
        self.id
    }

    async fn add_network(&self, network: &Network) -> anyhow::Result<()> {
        self.check_failing()?;
        self.networks.insert(network.key(), network.clone());
        Ok(())
    }

    async fn remove_network(&self, key: &NetworkKey) -> anyhow::Result<()> {
        self.check_failing()?;
        self.networks.remove(key);
        self.peers.retain(|(network, _), _| network != key);
        Ok(())
    }

    async fn update_certificate(&self, network: &Network) -> anyhow::Result<()> {
        self.check_failing()?;
        match self.networks.get_mut(&network.key()) {
            Some(mut entry) => {
                *entry = network.clone();
                Ok(())
            }
            None => bail!("network {} not routed", network.key().short()),
        }
    }

    async fn add_peer(
        &self,
        key: &NetworkKey,
        peer: HostId,
        local_port: u16,
        peer_port: u16,
    ) -> anyhow::Result<()> {
        if !self.networks.contains_key(key) {
            bail!("network {} not routed", key.short());
        }
        self.peers.insert((key.clone(), peer), (local_port, peer_port));
        Ok(())
    }

    async fn remove_peer(&self, key: &NetworkKey, peer: HostId) -> anyhow::Result<()> {
        self.peers.remove(&(key.clone(), peer));
        Ok(())
    }
}
