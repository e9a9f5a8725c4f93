//! Certificate chains: signed proof of network membership.
//!
//! A certificate owns its parent, recursively, up to a self-signed root.
//! The root's public key identifies the network ("network key"). A
//! certificate whose direct parent is the root is a first-level member
//! certificate and is considered trusted; anything further from the root
//! (invitation or provisional certificates) is not.
//!
//! Signatures cover a stable byte serialization of the certificate fields
//! (see `tbs_bytes`), never the serde representation.

use std::fmt;
use std::ops::BitOr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, Keypair, PUBLIC_KEY_LENGTH};

/// Issued certificates are predated to absorb clock skew between issuer and holder.
pub const CERT_PREDATE: Duration = Duration::from_secs(60 * 60);

/// Default validity of an issued certificate (~two years).
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 2);

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Key usage ─────────────────────────────────────────────────────────────────

/// Bitmask of operations a certificate's key is permitted to perform.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyUsage(u32);

impl KeyUsage {
    pub const NONE: KeyUsage = KeyUsage(0);
    /// Membership in a network's peer mesh.
    pub const PEER: KeyUsage = KeyUsage(1);
    pub const BOOTSTRAP: KeyUsage = KeyUsage(1 << 1);
    /// May sign other certificates.
    pub const SIGN: KeyUsage = KeyUsage(1 << 2);
    /// May relay broker traffic.
    pub const BROKER: KeyUsage = KeyUsage(1 << 3);
    pub const ENCIPHERMENT: KeyUsage = KeyUsage(1 << 4);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: KeyUsage) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no bit outside `allowed` is set.
    pub const fn is_subset_of(self, allowed: KeyUsage) -> bool {
        self.0 & !allowed.0 == 0
    }
}

impl BitOr for KeyUsage {
    type Output = KeyUsage;

    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        KeyUsage(self.0 | rhs.0)
    }
}

impl fmt::Debug for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyUsage({:#07b})", self.0)
    }
}

// ── Key type ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Undefined,
    Ed25519,
    X25519,
}

impl KeyType {
    fn code(self) -> u32 {
        match self {
            KeyType::Undefined => 0,
            KeyType::Ed25519 => 1,
            KeyType::X25519 => 2,
        }
    }
}

// ── Network key ───────────────────────────────────────────────────────────────

/// A network's identity: the public key of its self-signed root certificate.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkKey(#[serde(with = "crate::serde_hex")] Vec<u8>);

impl NetworkKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// First 8 bytes as hex, for log fields.
    pub fn short(&self) -> String {
        crypto::short_hex(&self.0)
    }
}

impl From<&[u8]> for NetworkKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkKey({})", hex::encode(&self.0))
    }
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A single defect found while validating a certificate or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("unsupported key type")]
    UnsupportedKeyType,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("unsupported key usage")]
    UnsupportedKeyUsage,
    #[error("invalid certificate request signature")]
    InvalidRequestSignature,
    #[error("invalid certificate signature")]
    InvalidSignature,
    #[error("not before limit exceeded")]
    NotBeforeRange,
    #[error("not after limit exceeded")]
    NotAfterRange,
}

/// Every defect found while walking a certificate chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("certificate verification failed: {0:?}")]
pub struct CertificateErrors(pub Vec<CertificateError>);

impl CertificateErrors {
    pub fn includes(&self, kind: CertificateError) -> bool {
        self.0.contains(&kind)
    }

    /// True if every recorded defect is `kind`.
    pub fn includes_only(&self, kind: CertificateError) -> bool {
        !self.0.is_empty() && self.0.iter().all(|e| *e == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateError> {
        self.0.iter()
    }
}

// ── Certificate ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    #[serde(with = "crate::serde_hex")]
    pub key: Vec<u8>,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
    pub subject: String,
    /// Unix seconds.
    pub not_before: u64,
    /// Unix seconds.
    pub not_after: u64,
    #[serde(with = "crate::serde_hex")]
    pub serial_number: Vec<u8>,
    #[serde(with = "crate::serde_hex")]
    pub signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Certificate>>,
}

impl Certificate {
    pub fn parent(&self) -> Option<&Certificate> {
        self.parent.as_deref()
    }

    /// Attach the signing certificate.
    pub fn with_parent(mut self, parent: Certificate) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// This certificate followed by each ancestor up to the root.
    pub fn chain(&self) -> impl Iterator<Item = &Certificate> {
        std::iter::successors(Some(self), |c| c.parent())
    }

    /// The self-signed root at the top of the chain.
    pub fn root(&self) -> &Certificate {
        let mut cert = self;
        while let Some(parent) = cert.parent() {
            cert = parent;
        }
        cert
    }

    /// The network this certificate belongs to.
    pub fn network_key(&self) -> NetworkKey {
        NetworkKey::from(self.root().key.as_slice())
    }

    /// First-level member certificate: the direct parent is the network root.
    pub fn is_trusted(&self) -> bool {
        match self.parent() {
            Some(parent) => parent.key == self.root().key,
            None => false,
        }
    }

    pub fn is_owned_by(&self, key: &[u8]) -> bool {
        self.key == key
    }

    /// Earliest expiry anywhere in the chain.
    pub fn earliest_not_after(&self) -> u64 {
        self.chain().map(|c| c.not_after).min().unwrap_or(self.not_after)
    }

    /// Stable byte representation covered by the signature.
    pub fn tbs_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(
            24 + self.key.len() + self.subject.len() + self.serial_number.len(),
        );
        b.extend_from_slice(&self.key);
        b.extend_from_slice(&self.key_type.code().to_be_bytes());
        b.extend_from_slice(&self.key_usage.bits().to_be_bytes());
        b.extend_from_slice(self.subject.as_bytes());
        b.extend_from_slice(&self.not_before.to_be_bytes());
        b.extend_from_slice(&self.not_after.to_be_bytes());
        b.extend_from_slice(&self.serial_number);
        b
    }

    /// Verify the whole chain against the current time.
    pub fn verify(&self) -> Result<(), CertificateErrors> {
        self.verify_at(unix_now())
    }

    /// Verify every link of the chain: each certificate must be signed by
    /// its parent (or itself, for the root), the signer must hold the
    /// `SIGN` usage, and `now` must fall inside each validity window.
    /// All defects are collected rather than stopping at the first.
    pub fn verify_at(&self, now: u64) -> Result<(), CertificateErrors> {
        let mut errs = Vec::new();

        for cert in self.chain() {
            let signer = cert.parent().unwrap_or(cert);
            if !signer.key_usage.contains(KeyUsage::SIGN) {
                errs.push(CertificateError::UnsupportedKeyUsage);
            }

            let valid = match signer.key_type {
                KeyType::Ed25519 => match <&[u8; PUBLIC_KEY_LENGTH]>::try_from(signer.key.as_slice()) {
                    Ok(public) => crypto::verify(public, &cert.tbs_bytes(), &cert.signature),
                    Err(_) => {
                        errs.push(CertificateError::InvalidKeyLength);
                        false
                    }
                },
                _ => {
                    errs.push(CertificateError::UnsupportedKeyType);
                    false
                }
            };
            if !valid {
                errs.push(CertificateError::InvalidSignature);
            }

            if now < cert.not_before {
                errs.push(CertificateError::NotBeforeRange);
            }
            if now > cert.not_after {
                errs.push(CertificateError::NotAfterRange);
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(CertificateErrors(errs))
        }
    }
}

// ── Certificate requests ──────────────────────────────────────────────────────

/// A signed request for a certificate over `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    #[serde(with = "crate::serde_hex")]
    pub key: Vec<u8>,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
    pub subject: String,
    #[serde(with = "crate::serde_hex")]
    pub signature: Vec<u8>,
}

impl CertificateRequest {
    /// Build a request for `keypair`, self-signed to prove key possession.
    pub fn new(keypair: &Keypair, usage: KeyUsage, subject: impl Into<String>) -> Self {
        let mut csr = Self {
            key: keypair.public.to_vec(),
            key_type: KeyType::Ed25519,
            key_usage: usage,
            subject: subject.into(),
            signature: Vec::new(),
        };
        csr.signature = keypair.sign(&csr.tbs_bytes()).to_vec();
        csr
    }

    pub fn tbs_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(8 + self.key.len() + self.subject.len());
        b.extend_from_slice(&self.key);
        b.extend_from_slice(&self.key_type.code().to_be_bytes());
        b.extend_from_slice(&self.key_usage.bits().to_be_bytes());
        b.extend_from_slice(self.subject.as_bytes());
        b
    }

    /// Check the requested usage is within `allowed` and the request is
    /// signed by the key it names.
    pub fn verify(&self, allowed: KeyUsage) -> Result<(), CertificateError> {
        if !self.key_usage.is_subset_of(allowed) {
            return Err(CertificateError::UnsupportedKeyUsage);
        }
        match self.key_type {
            KeyType::Ed25519 => {
                let public = <&[u8; PUBLIC_KEY_LENGTH]>::try_from(self.key.as_slice())
                    .map_err(|_| CertificateError::InvalidKeyLength)?;
                if !crypto::verify(public, &self.tbs_bytes(), &self.signature) {
                    return Err(CertificateError::InvalidRequestSignature);
                }
                Ok(())
            }
            _ => Err(CertificateError::UnsupportedKeyType),
        }
    }
}

/// Issue a certificate for `csr`, signed by `signer`, valid from
/// `now - CERT_PREDATE` until `now + validity`. The caller attaches the
/// signer's certificate as parent.
pub fn sign_certificate_request_at(
    csr: &CertificateRequest,
    validity: Duration,
    signer: &Keypair,
    now: u64,
) -> Certificate {
    let mut cert = Certificate {
        key: csr.key.clone(),
        key_type: csr.key_type,
        key_usage: csr.key_usage,
        subject: csr.subject.clone(),
        not_before: now.saturating_sub(CERT_PREDATE.as_secs()),
        not_after: now.saturating_add(validity.as_secs()),
        serial_number: crypto::random_bytes::<16>().to_vec(),
        signature: Vec::new(),
        parent: None,
    };
    cert.signature = signer.sign(&cert.tbs_bytes()).to_vec();
    cert
}

pub fn sign_certificate_request(
    csr: &CertificateRequest,
    validity: Duration,
    signer: &Keypair,
) -> Certificate {
    sign_certificate_request_at(csr, validity, signer, unix_now())
}

/// A self-signed root certificate, the identity of a new network.
pub fn new_self_signed(
    keypair: &Keypair,
    usage: KeyUsage,
    validity: Duration,
    subject: impl Into<String>,
) -> Certificate {
    let csr = CertificateRequest::new(keypair, usage, subject);
    sign_certificate_request(&csr, validity, keypair)
}
