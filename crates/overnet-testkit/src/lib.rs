//! overnet-testkit: in-memory collaborators for exercising Control.
//!
//! Nothing here is fit for production: the broker leaks key digests and
//! links never leave the process.

pub mod authority;
pub mod broker;
pub mod fixtures;
pub mod host;
pub mod link;
pub mod node;

pub use authority::{MemoryAuthority, MemoryDialer};
pub use broker::HashBroker;
pub use fixtures::TestNetwork;
pub use host::MemoryHost;
pub use link::{LoopbackPeerClient, LoopbackTarget, MemoryLink, RelayAuthority};
pub use node::{connect, eventually, test_config, wait_for_event, Connection, TestNode};

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
