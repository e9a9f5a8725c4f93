//! overnet-core: certificates, keys, network records and control messages.
//! All other overnet crates depend on this one.

pub mod certificate;
pub mod config;
pub mod crypto;
pub mod message;
pub mod network;
pub mod serde_hex;

pub use certificate::{
    Certificate, CertificateError, CertificateErrors, CertificateRequest, KeyType, KeyUsage,
    NetworkKey,
};
pub use config::{ConfigError, ControlConfig, OvernetConfig};
pub use crypto::Keypair;
pub use message::{NetworkPeerBinding, PeerMessage};
pub use network::{Network, Profile};
