//! Per-peer control channel messages.
//!
//! Four request/ack messages travel over the neighbor's control stream.
//! The transport that carries them is not part of this crate; adapters
//! map these types onto whatever RPC framing the overlay uses.

use serde::{Deserialize, Serialize};

use crate::certificate::{Certificate, NetworkKey};

/// One network's data-channel offer: the sender's reserved port and the
/// certificate proving its membership.
///
/// `port` is carried as u32 on the wire; receivers reject values that do
/// not fit in 16 bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPeerBinding {
    pub port: u32,
    pub certificate: Certificate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Init handshake. Announces only how many networks the sender knows.
    Negotiate { key_count: u32 },
    /// Bindings for the networks both sides share, in intersection order.
    Open { bindings: Vec<NetworkPeerBinding> },
    /// Sever one network's binding without closing the physical link.
    Close { network_key: NetworkKey },
    /// The sender's certificate for a shared network changed.
    UpdateCertificate { certificate: Certificate },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Negotiate { .. } => "negotiate",
            PeerMessage::Open { .. } => "open",
            PeerMessage::Close { .. } => "close",
            PeerMessage::UpdateCertificate { .. } => "update_certificate",
        }
    }
}
