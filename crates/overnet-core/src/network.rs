//! Network records: the persisted description of one private community.

use serde::{Deserialize, Serialize};

use crate::certificate::{Certificate, NetworkKey};
use crate::crypto::Keypair;

/// The local profile: the identity this node presents to every network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub key: Keypair,
}

/// A network this node is a member of.
///
/// Exactly one certificate chain is active at a time. Control replaces
/// the whole record when the certificate is renewed, so readers never
/// observe a half-updated chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Locally unique.
    pub id: u64,
    pub name: String,
    /// Membership proof for the local profile key, rooted at the network root.
    pub certificate: Certificate,
    /// Overrides the profile name as certificate subject when non-empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alt_profile_name: String,
    /// Root key pair. Only present on the node that created the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_key: Option<Keypair>,
}

impl Network {
    pub fn key(&self) -> NetworkKey {
        self.certificate.network_key()
    }

    pub fn root_certificate(&self) -> &Certificate {
        self.certificate.root()
    }

    /// Subject the next certificate request should carry.
    pub fn certificate_subject<'a>(&'a self, profile: &'a Profile) -> &'a str {
        if self.alt_profile_name.is_empty() {
            &profile.name
        } else {
            &self.alt_profile_name
        }
    }

    /// The alternate name no longer matches the certificate subject.
    pub fn is_subject_mismatched(&self) -> bool {
        !self.alt_profile_name.is_empty() && self.alt_profile_name != self.certificate.subject
    }
}
