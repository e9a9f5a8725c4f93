//! Certificate trust cache: which networks this node can prove membership in.
//!
//! Keyed by network key (the root public key). Each entry carries the local
//! network id, the active certificate chain, and whether that chain is a
//! first-level member certificate. Provisional (invitation-stage)
//! certificates are cached too: they can still be offered in bindings,
//! they just never open a data channel on their own.
//!
//! `keys()` is the local set fed into private set intersection, so it is
//! always returned in a stable order and taken as one consistent snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use overnet_core::{Certificate, Network, NetworkKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateEntry {
    pub network_id: u64,
    pub certificate: Certificate,
    pub trusted: bool,
}

pub struct CertificateTrustCache {
    entries: Arc<RwLock<BTreeMap<NetworkKey, CertificateEntry>>>,
}

impl Default for CertificateTrustCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateTrustCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<NetworkKey, CertificateEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<NetworkKey, CertificateEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index `network` by its root key, replacing any previous entry.
    pub fn insert(&self, network: &Network) {
        let certificate = network.certificate.clone();
        let trusted = certificate.is_trusted();
        self.write().insert(
            network.key(),
            CertificateEntry {
                network_id: network.id,
                certificate,
                trusted,
            },
        );
    }

    pub fn get(&self, key: &NetworkKey) -> Option<CertificateEntry> {
        self.read().get(key).cloned()
    }

    pub fn delete(&self, key: &NetworkKey) {
        self.write().remove(key);
    }

    /// All known network keys, sorted.
    pub fn keys(&self) -> Vec<NetworkKey> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Clone for CertificateTrustCache {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}
