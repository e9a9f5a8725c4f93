//! Networks and certificates for tests.

use std::sync::Arc;
use std::time::Duration;

use overnet_core::certificate::{
    new_self_signed, sign_certificate_request, sign_certificate_request_at, unix_now,
    DEFAULT_CERT_TTL,
};
use overnet_core::{Certificate, CertificateRequest, KeyUsage, Keypair, Network, NetworkKey};

use crate::authority::MemoryAuthority;

/// A network root and its authority.
pub struct TestNetwork {
    pub name: String,
    root_key: Keypair,
    root_certificate: Certificate,
    authority: Arc<MemoryAuthority>,
}

impl TestNetwork {
    pub fn new(name: &str) -> Self {
        let root_key = Keypair::generate();
        let root_certificate =
            new_self_signed(&root_key, KeyUsage::PEER | KeyUsage::SIGN, DEFAULT_CERT_TTL, name);
        let authority = Arc::new(MemoryAuthority::new(
            root_key.clone(),
            root_certificate.clone(),
        ));
        Self {
            name: name.to_string(),
            root_key,
            root_certificate,
            authority,
        }
    }

    pub fn key(&self) -> NetworkKey {
        self.root_certificate.network_key()
    }

    pub fn root_certificate(&self) -> &Certificate {
        &self.root_certificate
    }

    /// The network's authority. Every call returns the same instance.
    pub fn authority(&self) -> Arc<MemoryAuthority> {
        Arc::clone(&self.authority)
    }

    /// First-level member certificate, valid for the default lifetime.
    pub fn member_certificate(&self, key: &Keypair, subject: &str) -> Certificate {
        let csr = CertificateRequest::new(key, KeyUsage::PEER | KeyUsage::SIGN, subject);
        sign_certificate_request(&csr, DEFAULT_CERT_TTL, &self.root_key)
            .with_parent(self.root_certificate.clone())
    }

    /// Member certificate that expires `remaining` from now.
    pub fn member_certificate_expiring_in(
        &self,
        key: &Keypair,
        subject: &str,
        remaining: Duration,
    ) -> Certificate {
        let csr = CertificateRequest::new(key, KeyUsage::PEER | KeyUsage::SIGN, subject);
        sign_certificate_request_at(&csr, remaining, &self.root_key, unix_now())
            .with_parent(self.root_certificate.clone())
    }

    /// Member certificate whose `NotAfter` passed `ago` before now.
    pub fn expired_member_certificate(&self, key: &Keypair, subject: &str, ago: Duration) -> Certificate {
        let csr = CertificateRequest::new(key, KeyUsage::PEER | KeyUsage::SIGN, subject);
        let issued = unix_now().saturating_sub(ago.as_secs() + 3600);
        sign_certificate_request_at(&csr, Duration::from_secs(3600), &self.root_key, issued)
            .with_parent(self.root_certificate.clone())
    }

    /// Invitation certificate issued by a fresh member rather than the root.
    pub fn provisional_certificate(&self, key: &Keypair, subject: &str) -> Certificate {
        let inviter = Keypair::generate();
        let inviter_certificate = self.member_certificate(&inviter, "inviter");
        let csr = CertificateRequest::new(key, KeyUsage::PEER, subject);
        sign_certificate_request(&csr, DEFAULT_CERT_TTL, &inviter).with_parent(inviter_certificate)
    }

    /// A network record holding `certificate`.
    pub fn network(&self, id: u64, certificate: Certificate) -> Network {
        Network {
            id,
            name: self.name.clone(),
            certificate,
            alt_profile_name: String::new(),
            root_key: None,
        }
    }

    /// The record the network's creator holds: member certificate plus root key.
    pub fn owner_network(&self, id: u64, key: &Keypair, subject: &str) -> Network {
        Network {
            root_key: Some(self.root_key.clone()),
            ..self.network(id, self.member_certificate(key, subject))
        }
    }
}
