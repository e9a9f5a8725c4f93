//! Control-plane errors.
//!
//! Protocol errors abort a single negotiation attempt; nothing here is
//! fatal to the process. Collaborator failures arrive as `anyhow::Error`
//! and are wrapped into the variant naming the boundary they crossed.

use overnet_core::CertificateErrors;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("network not found")]
    NetworkNotFound,
    #[error("duplicate network id {0}")]
    DuplicateNetwork(u64),
    #[error("network bindings empty")]
    NetworkBindingsEmpty,
    #[error("network binding not found")]
    NetworkBindingNotFound,
    #[error("link identity and network certificate key mismatch")]
    NetworkOwnerMismatch,
    #[error("network authority mismatch")]
    NetworkAuthorityMismatch,
    #[error("peer port {0} out of range")]
    NetworkIDBounds(u32),
    #[error("provisional certificate")]
    ProvisionalCertificate,
    #[error("cannot begin new negotiation until previous negotiation finishes")]
    AlreadySyncing,
    #[error("one or both peers have zero keys")]
    EmptyKeySet,
    #[error("binding count mismatch: sent {local}, received {peer}")]
    BindingCountMismatch { local: usize, peer: usize },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("cancelled")]
    Cancelled,
    #[error("control loop already running")]
    AlreadyRunning,

    #[error(transparent)]
    Certificate(#[from] CertificateErrors),
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("peer rpc failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("network key broker failed: {0:#}")]
    Broker(anyhow::Error),
    #[error("certificate authority request failed: {0:#}")]
    Authority(anyhow::Error),
    #[error("overlay host: {0:#}")]
    Host(anyhow::Error),
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;
