//! In-memory certificate authority and dialer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use overnet_control::{AuthorityClient, AuthorityDialer};
use overnet_core::certificate::{sign_certificate_request, DEFAULT_CERT_TTL};
use overnet_core::{Certificate, CertificateRequest, KeyUsage, Keypair, NetworkKey};

/// Issues first-level member certificates with the network root key.
pub struct MemoryAuthority {
    root_key: Keypair,
    root_certificate: Certificate,
    validity: Duration,
    requests: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemoryAuthority {
    pub fn new(root_key: Keypair, root_certificate: Certificate) -> Self {
        Self::with_validity(root_key, root_certificate, DEFAULT_CERT_TTL)
    }

    pub fn with_validity(root_key: Keypair, root_certificate: Certificate, validity: Duration) -> Self {
        Self {
            root_key,
            root_certificate,
            validity,
            requests: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn network_key(&self) -> NetworkKey {
        self.root_certificate.network_key()
    }

    /// Renewal requests received, successful or not.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Make every subsequent request fail as if the authority were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthorityClient for MemoryAuthority {
    async fn renew(
        &self,
        certificate: &Certificate,
        request: &CertificateRequest,
    ) -> anyhow::Result<Certificate> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("authority unreachable");
        }
        if certificate.network_key() != self.network_key() {
            bail!("certificate belongs to another network");
        }
        if !certificate.is_owned_by(&request.key) {
            bail!("request key does not match certificate key");
        }
        request
            .verify(KeyUsage::PEER | KeyUsage::SIGN)
            .map_err(|e| anyhow!("invalid certificate request: {e}"))?;

        Ok(sign_certificate_request(request, self.validity, &self.root_key)
            .with_parent(self.root_certificate.clone()))
    }
}

/// Routes `dial` to whichever authorities have been registered.
#[derive(Clone, Default)]
pub struct MemoryDialer {
    authorities: Arc<DashMap<NetworkKey, Arc<MemoryAuthority>>>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, authority: Arc<MemoryAuthority>) {
        self.authorities.insert(authority.network_key(), authority);
    }
}

#[async_trait]
impl AuthorityDialer for MemoryDialer {
    async fn dial(&self, key: &NetworkKey) -> anyhow::Result<Arc<dyn AuthorityClient>> {
        let authority: Arc<dyn AuthorityClient> = self
            .authorities
            .get(key)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| anyhow!("no route to authority for {}", key.short()))?;
        Ok(authority)
    }
}
