//! overnet-control: network membership negotiation and certificate trust.
//!
//! `Control` owns the node's networks and drives one `Peer` per directly
//! connected neighbor. Peers discover shared networks through a private
//! set intersection broker, exchange certificate-backed bindings, and open
//! per-network data channels once both sides are first-level members.
//! Control also keeps every network certificate renewed, directly with the
//! network authority or relayed through a trusted neighbor.

pub mod control;
pub mod error;
pub mod event;
pub mod interfaces;
pub mod mailbox;
pub mod peer;
pub mod renewal;
pub mod store;
pub mod trust;

#[cfg(test)]
mod test_support;

pub use control::{Collaborators, Control};
pub use error::{ControlError, Result};
pub use event::{Event, NetworkEvent, Observers};
pub use interfaces::{
    AuthorityClient, AuthorityDialer, Broker, BrokerIo, BrokerStream, Host, HostId, NeighborLink,
    NetworkPeerClient, PeerClient,
};
pub use peer::{NetworkBinding, Peer, Role};
pub use store::{JsonNetworkStore, MemoryNetworkStore, NetworkStore, StoreError};
pub use trust::{CertificateEntry, CertificateTrustCache};
