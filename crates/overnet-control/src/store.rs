//! Network persistence.
//!
//! Control writes through the store before touching in-memory state and
//! puts the old record back if the overlay then refuses the change, so a
//! failed operation leaves the node unchanged. Two implementations: an
//! in-memory map for tests and embedders that persist elsewhere, and a
//! JSON file holding the whole network list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use overnet_core::Network;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize networks: {0}")]
    SerializeFailed(serde_json::Error),
}

pub trait NetworkStore: Send + Sync {
    /// Every stored network, ordered by id.
    fn load(&self) -> Result<Vec<Network>, StoreError>;

    /// Insert or replace by id.
    fn save(&self, network: &Network) -> Result<(), StoreError>;

    fn delete(&self, id: u64) -> Result<(), StoreError>;
}

fn sorted(networks: &DashMap<u64, Network>) -> Vec<Network> {
    let mut list: Vec<Network> = networks.iter().map(|e| e.value().clone()).collect();
    list.sort_by_key(|n| n.id);
    list
}

// ── Memory ────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryNetworkStore {
    networks: Arc<DashMap<u64, Network>>,
}

impl MemoryNetworkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `networks`, as if loaded from disk.
    pub fn with_networks(networks: impl IntoIterator<Item = Network>) -> Self {
        let store = Self::new();
        for network in networks {
            store.networks.insert(network.id, network);
        }
        store
    }

    pub fn get(&self, id: u64) -> Option<Network> {
        self.networks.get(&id).map(|n| n.value().clone())
    }
}

impl NetworkStore for MemoryNetworkStore {
    fn load(&self) -> Result<Vec<Network>, StoreError> {
        Ok(sorted(&self.networks))
    }

    fn save(&self, network: &Network) -> Result<(), StoreError> {
        self.networks.insert(network.id, network.clone());
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.networks.remove(&id);
        Ok(())
    }
}

// ── JSON file ─────────────────────────────────────────────────────────────────

/// The network list as one JSON document, rewritten on every mutation.
///
/// Writes go to a sibling temp file and are renamed into place.
pub struct JsonNetworkStore {
    path: PathBuf,
    networks: DashMap<u64, Network>,
}

impl JsonNetworkStore {
    /// Open the store at `path`, loading existing networks if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let networks = DashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let list: Vec<Network> = serde_json::from_str(&text)
                    .map_err(|e| StoreError::ParseFailed(path.clone(), e))?;
                tracing::info!(count = list.len(), path = %path.display(), "loaded persisted networks");
                for network in list {
                    networks.insert(network.id, network);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::ReadFailed(path, e)),
        }

        Ok(Self { path, networks })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&sorted(&self.networks))
            .map_err(StoreError::SerializeFailed)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::WriteFailed(self.path.clone(), e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::WriteFailed(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| StoreError::WriteFailed(self.path.clone(), e))
    }
}

impl NetworkStore for JsonNetworkStore {
    fn load(&self) -> Result<Vec<Network>, StoreError> {
        Ok(sorted(&self.networks))
    }

    fn save(&self, network: &Network) -> Result<(), StoreError> {
        let previous = self.networks.insert(network.id, network.clone());
        if let Err(e) = self.flush() {
            match previous {
                Some(previous) => self.networks.insert(network.id, previous),
                None => self.networks.remove(&network.id).map(|(_, n)| n),
            };
            tracing::warn!(error = %e, network_id = network.id, "failed to persist network");
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        let Some((_, previous)) = self.networks.remove(&id) else {
            return Ok(());
        };
        if let Err(e) = self.flush() {
            self.networks.insert(id, previous);
            tracing::warn!(error = %e, network_id = id, "failed to persist network removal");
            return Err(e);
        }
        Ok(())
    }
}
