//! The shared Directory: a DHT-backed map from stream/track key to the
//! node address currently publishing it.
//!
//! Records are BEP-44 mutable items signed with a key derived from the
//! lookup key and verified against its sha1-derived target. `mainline`
//! is the concrete DHT backend; it is treated as a black-box
//! collaborator behind the `Directory` trait so the republish/expiry
//! policy and error taxonomy stay testable without a live swarm, via
//! `InMemoryDirectory`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{NodeAddress, StreamKey};

/// BEP-44 records expire after roughly two hours on the mainline DHT;
/// `DHTStore`'s `Exp` matches this. Republish well inside that window.
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait Directory: Send + Sync {
    async fn put(&self, key: &StreamKey, address: &NodeAddress) -> Result<()>;
    async fn get(&self, key: &StreamKey) -> Result<Option<NodeAddress>>;
    async fn delete(&self, key: &StreamKey) -> Result<()>;
}

/// `mainline`-backed directory with a background republish loop.
pub struct MainlineDirectory {
    dht: mainline::Dht,
    published: Arc<DashMap<StreamKey, NodeAddress>>,
    republish_cancel: CancellationToken,
}

impl MainlineDirectory {
    /// Build a DHT client seeded with `bootstrap_nodes` (in addition to
    /// the library's own default bootstrap set). An empty slice falls
    /// back to `mainline`'s defaults.
    pub fn bootstrap(bootstrap_nodes: &[String]) -> Result<Self> {
        let dht = if bootstrap_nodes.is_empty() {
            mainline::Dht::client()
        } else {
            mainline::Dht::builder()
                .bootstrap(bootstrap_nodes)
                .build()
        }
        .map_err(|e| Error::Fatal(e.to_string()))?;
        let published: Arc<DashMap<StreamKey, NodeAddress>> = Arc::new(DashMap::new());
        let republish_cancel = CancellationToken::new();

        let task_dht = dht.clone();
        let task_published = published.clone();
        let task_cancel = republish_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPUBLISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for entry in task_published.iter() {
                    if let Err(err) = put_mutable(&task_dht, entry.key(), entry.value()) {
                        warn!(key = %entry.key(), error = %err, "directory republish failed");
                    } else {
                        debug!(key = %entry.key(), "republished directory entry");
                    }
                }
            }
        });

        Ok(Self {
            dht,
            published,
            republish_cancel,
        })
    }
}

fn put_mutable(dht: &mainline::Dht, key: &StreamKey, address: &NodeAddress) -> Result<()> {
    let signing_key = key.signing_key();
    let item = mainline::MutableItem::new(signing_key, address.as_str().as_bytes(), 0, None);
    dht.put_mutable(item, None)
        .map_err(|e| Error::Unavailable(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl Directory for MainlineDirectory {
    async fn put(&self, key: &StreamKey, address: &NodeAddress) -> Result<()> {
        let dht = self.dht.clone();
        let key_owned = key.clone();
        let address_owned = address.clone();
        tokio::task::spawn_blocking(move || put_mutable(&dht, &key_owned, &address_owned))
            .await
            .map_err(|e| Error::Fatal(e.to_string()))??;
        self.published.insert(key.clone(), address.clone());
        Ok(())
    }

    async fn get(&self, key: &StreamKey) -> Result<Option<NodeAddress>> {
        let dht = self.dht.clone();
        let public_key = key.signing_key().verifying_key().to_bytes();
        let found = tokio::task::spawn_blocking(move || {
            dht.get_mutable_most_recent(&public_key, None).map(|item| {
                String::from_utf8_lossy(item.value()).into_owned()
            })
        })
        .await
        .map_err(|e| Error::Fatal(e.to_string()))?;
        Ok(found.map(NodeAddress::from))
    }

    async fn delete(&self, key: &StreamKey) -> Result<()> {
        // BEP-44 has no delete; stop republishing and let the record
        // expire at the end of its TTL.
        self.published.remove(key);
        Ok(())
    }
}

impl Drop for MainlineDirectory {
    fn drop(&mut self) {
        self.republish_cancel.cancel();
    }
}

/// In-memory fake for tests and for `InMemoryDirectory`-backed single
/// node demos.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: Mutex<std::collections::HashMap<StreamKey, NodeAddress>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn put(&self, key: &StreamKey, address: &NodeAddress) -> Result<()> {
        self.entries.lock().await.insert(key.clone(), address.clone());
        Ok(())
    }

    async fn get(&self, key: &StreamKey) -> Result<Option<NodeAddress>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &StreamKey) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let directory = InMemoryDirectory::new();
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        directory.put(&key, &"1.2.3.4:9000".into()).await.unwrap();
        assert_eq!(
            directory.get(&key).await.unwrap(),
            Some("1.2.3.4:9000".into())
        );
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let directory = InMemoryDirectory::new();
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        directory.put(&key, &"1.2.3.4:9000".into()).await.unwrap();
        directory.delete(&key).await.unwrap();
        assert_eq!(directory.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_on_unknown_key_returns_none() {
        let directory = InMemoryDirectory::new();
        let key = StreamKey::derive(&"s".into(), &"missing".into(), "");
        assert_eq!(directory.get(&key).await.unwrap(), None);
    }
}
