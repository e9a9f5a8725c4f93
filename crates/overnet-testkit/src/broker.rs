//! Reference broker for tests.
//!
//! The sender writes the BLAKE3 digest of every key; the receiver keeps the
//! local keys whose digest appears. The intersection is correct but the
//! exchange is not private: digests of non-shared keys are visible to the
//! receiver. Never use outside tests.
//!
//! Wire format: u32 BE count, then `count` 32-byte digests.

use std::collections::HashSet;

use anyhow::{bail, Context};
use async_trait::async_trait;
use overnet_control::{Broker, BrokerIo};
use overnet_core::crypto;
use overnet_core::NetworkKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on announced keys, to reject garbage before allocating.
const MAX_KEYS: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct HashBroker;

fn digest(key: &NetworkKey) -> [u8; 32] {
    crypto::hash(key.as_bytes())
}

#[async_trait]
impl Broker for HashBroker {
    async fn send_keys(&self, stream: &mut dyn BrokerIo, keys: &[NetworkKey]) -> anyhow::Result<()> {
        let count = u32::try_from(keys.len()).context("too many keys")?;
        stream.write_u32(count).await?;
        for key in keys {
            stream.write_all(&digest(key)).await?;
        }
        stream.flush().await?;
        Ok(())
    }

    async fn receive_keys(
        &self,
        stream: &mut dyn BrokerIo,
        keys: &[NetworkKey],
    ) -> anyhow::Result<Vec<NetworkKey>> {
        let count = stream.read_u32().await?;
        if count > MAX_KEYS {
            bail!("peer announced {count} keys");
        }

        let mut remote = HashSet::with_capacity(count as usize);
        for _ in 0..count {
            let mut hash = [0u8; 32];
            stream.read_exact(&mut hash).await?;
            remote.insert(hash);
        }

        Ok(keys
            .iter()
            .filter(|key| remote.contains(&digest(key)))
            .cloned()
            .collect())
    }
}
