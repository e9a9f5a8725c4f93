//! A complete in-process node: Control wired to in-memory collaborators.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use overnet_control::{
    Collaborators, Control, ControlError, Event, HostId, MemoryNetworkStore, NetworkStore, Observers,
    Peer,
};
use overnet_core::certificate::{new_self_signed, DEFAULT_CERT_TTL};
use overnet_core::crypto;
use overnet_core::{Certificate, ControlConfig, KeyUsage, Keypair, Profile};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::authority::MemoryDialer;
use crate::broker::HashBroker;
use crate::host::MemoryHost;
use crate::link::{LoopbackPeerClient, MemoryLink};

/// Short timeouts so stray negotiation rounds finish quickly.
pub fn test_config() -> ControlConfig {
    ControlConfig {
        negotiation_timeout_secs: 2,
        renew_timeout_secs: 2,
        ..ControlConfig::default()
    }
}

pub struct TestNode {
    pub profile: Profile,
    pub host_id: HostId,
    /// Self-signed identity shown to neighbors.
    pub identity: Certificate,
    pub host: MemoryHost,
    pub dialer: MemoryDialer,
    pub observers: Observers,
    pub control: Control,
    cancel: CancellationToken,
}

impl TestNode {
    pub fn new(name: &str) -> Self {
        Self::with_store(name, test_config(), Arc::new(MemoryNetworkStore::new()))
    }

    pub fn with_store(name: &str, config: ControlConfig, store: Arc<dyn NetworkStore>) -> Self {
        let profile = Profile {
            name: name.to_string(),
            key: Keypair::generate(),
        };
        let host_id = HostId(crypto::hash(&profile.key.public));
        let identity = new_self_signed(&profile.key, KeyUsage::PEER, DEFAULT_CERT_TTL, name);

        let host = MemoryHost::new(host_id);
        let dialer = MemoryDialer::new();
        let observers = Observers::new(config.event_buffer);
        let cancel = CancellationToken::new();
        let collaborators = Collaborators {
            host: Arc::new(host.clone()),
            broker: Arc::new(HashBroker),
            store,
            dialer: Arc::new(dialer.clone()),
        };
        let control = Control::new(
            config,
            profile.clone(),
            observers.clone(),
            collaborators,
            cancel.clone(),
        );

        Self {
            profile,
            host_id,
            identity,
            host,
            dialer,
            observers,
            control,
            cancel,
        }
    }

    /// Run the event loop in the background.
    pub fn start(&self) -> JoinHandle<Result<(), ControlError>> {
        let control = self.control.clone();
        tokio::spawn(async move { control.run().await })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Local events (peer and network state) from here on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.observers.subscribe_local()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Both halves of a link between two nodes.
pub struct Connection {
    /// `b` as seen from `a`.
    pub a_peer: Arc<Peer>,
    /// `a` as seen from `b`.
    pub b_peer: Arc<Peer>,
    pub a_link: Arc<MemoryLink>,
    pub b_link: Arc<MemoryLink>,
    pub a_client: Arc<LoopbackPeerClient>,
    pub b_client: Arc<LoopbackPeerClient>,
}

/// Link `a` and `b`, registering each as peer `peer_id` of the other.
///
/// Renewals relayed through a neighbor reach whatever authorities that
/// neighbor's dialer knows.
pub fn connect(a: &TestNode, b: &TestNode, peer_id: u64) -> anyhow::Result<Connection> {
    let (a_link, b_link) = MemoryLink::pair(
        (a.host_id, a.identity.clone()),
        (b.host_id, b.identity.clone()),
    );
    let a_link = Arc::new(a_link);
    let b_link = Arc::new(b_link);

    let (a_client, a_target) = LoopbackPeerClient::new(Arc::new(b.dialer.clone()));
    let (b_client, b_target) = LoopbackPeerClient::new(Arc::new(a.dialer.clone()));
    let a_client = Arc::new(a_client);
    let b_client = Arc::new(b_client);

    let a_peer = a.control.add_peer(peer_id, a_link.clone(), a_client.clone())?;
    let b_peer = b.control.add_peer(peer_id, b_link.clone(), b_client.clone())?;
    a_target.connect(Arc::clone(&b_peer));
    b_target.connect(Arc::clone(&a_peer));

    Ok(Connection {
        a_peer,
        b_peer,
        a_link,
        b_link,
        a_client,
        b_client,
    })
}

// ── Waiting ───────────────────────────────────────────────────────────────────

/// Next event matching `pred`, or `None` if `timeout` passes first.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut pred: F,
) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
