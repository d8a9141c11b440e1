//! # Record Storage Boundary
//!
//! The dispatcher persists three kinds of records per cluster:
//!
//! - immutable **values** (`key → value`, TTL-bound)
//! - mutable **names** (`name → record`, generation-monotone)
//! - **peer announcements** (`info_hash → endpoints`, TTL-bound)
//!
//! [`RecordStore`] is the boundary a production deployment implements over
//! Redis. [`MemoryStore`] is the in-process implementation used by the
//! binary default and by every test; it is also the behavioral reference
//! for external backends, generation monotonicity included.
//!
//! All methods are safe for concurrent calls from dispatcher query handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::envelope::ClusterId;
use crate::identity::NodeId;
use crate::messages::PeerEntry;

/// Cluster-scoped record storage. TTLs are in seconds; a TTL of zero means
/// the record does not expire.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Fetch an immutable value and its remaining TTL.
    async fn get(&self, cluster: &ClusterId, key: &NodeId) -> Option<(Vec<u8>, u64)>;

    /// Write an immutable value.
    async fn put(&self, cluster: &ClusterId, key: &NodeId, value: Vec<u8>, ttl: u64) -> bool;

    /// Fetch a name record payload and its generation.
    async fn get_name(&self, cluster: &ClusterId, name: &NodeId) -> Option<(Vec<u8>, u64)>;

    /// Write a name record. Must reject any generation that is not strictly
    /// greater than the stored one.
    async fn put_name(
        &self,
        cluster: &ClusterId,
        name: &NodeId,
        value: Vec<u8>,
        generation: u64,
        ttl: u64,
    ) -> bool;

    /// Endpoints announced under an info hash.
    async fn get_peers(&self, cluster: &ClusterId, info_hash: &NodeId) -> Vec<PeerEntry>;

    /// Record an announcement.
    async fn announce(
        &self,
        cluster: &ClusterId,
        info_hash: &NodeId,
        addr: SocketAddr,
        meta: Option<Vec<u8>>,
        ttl: u64,
    ) -> bool;
}

struct ValueEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

struct NameEntry {
    value: Vec<u8>,
    generation: u64,
    expires_at: Option<Instant>,
}

struct PeerRecord {
    meta: Option<Vec<u8>>,
    expires_at: Option<Instant>,
}

fn expiry(ttl: u64) -> Option<Instant> {
    (ttl > 0).then(|| Instant::now() + Duration::from_secs(ttl))
}

fn live(expires_at: &Option<Instant>) -> bool {
    expires_at.map_or(true, |at| Instant::now() < at)
}

fn remaining(expires_at: &Option<Instant>) -> u64 {
    expires_at.map_or(0, |at| {
        at.saturating_duration_since(Instant::now()).as_secs()
    })
}

/// In-memory [`RecordStore`]. Expired entries are dropped lazily on access
/// and swept whenever their key is touched.
pub struct MemoryStore {
    values: RwLock<HashMap<(ClusterId, NodeId), ValueEntry>>,
    names: RwLock<HashMap<(ClusterId, NodeId), NameEntry>>,
    peers: RwLock<HashMap<(ClusterId, NodeId), HashMap<SocketAddr, PeerRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, cluster: &ClusterId, key: &NodeId) -> Option<(Vec<u8>, u64)> {
        let mut values = self.values.write().await;
        let slot = (*cluster, *key);
        match values.get(&slot) {
            Some(entry) if live(&entry.expires_at) => {
                Some((entry.value.clone(), remaining(&entry.expires_at)))
            }
            Some(_) => {
                values.remove(&slot);
                None
            }
            None => None,
        }
    }

    async fn put(&self, cluster: &ClusterId, key: &NodeId, value: Vec<u8>, ttl: u64) -> bool {
        let mut values = self.values.write().await;
        values.insert(
            (*cluster, *key),
            ValueEntry {
                value,
                expires_at: expiry(ttl),
            },
        );
        true
    }

    async fn get_name(&self, cluster: &ClusterId, name: &NodeId) -> Option<(Vec<u8>, u64)> {
        let mut names = self.names.write().await;
        let slot = (*cluster, *name);
        match names.get(&slot) {
            Some(entry) if live(&entry.expires_at) => {
                Some((entry.value.clone(), entry.generation))
            }
            Some(_) => {
                names.remove(&slot);
                None
            }
            None => None,
        }
    }

    async fn put_name(
        &self,
        cluster: &ClusterId,
        name: &NodeId,
        value: Vec<u8>,
        generation: u64,
        ttl: u64,
    ) -> bool {
        let mut names = self.names.write().await;
        let slot = (*cluster, *name);
        if let Some(existing) = names.get(&slot) {
            if live(&existing.expires_at) && generation <= existing.generation {
                return false;
            }
        }
        names.insert(
            slot,
            NameEntry {
                value,
                generation,
                expires_at: expiry(ttl),
            },
        );
        true
    }

    async fn get_peers(&self, cluster: &ClusterId, info_hash: &NodeId) -> Vec<PeerEntry> {
        let mut peers = self.peers.write().await;
        let slot = (*cluster, *info_hash);
        let Some(swarm) = peers.get_mut(&slot) else {
            return Vec::new();
        };
        swarm.retain(|_, record| live(&record.expires_at));
        let entries = swarm
            .iter()
            .map(|(addr, record)| PeerEntry {
                addr: *addr,
                meta: record.meta.clone(),
            })
            .collect();
        if swarm.is_empty() {
            peers.remove(&slot);
        }
        entries
    }

    async fn announce(
        &self,
        cluster: &ClusterId,
        info_hash: &NodeId,
        addr: SocketAddr,
        meta: Option<Vec<u8>>,
        ttl: u64,
    ) -> bool {
        let mut peers = self.peers.write().await;
        peers.entry((*cluster, *info_hash)).or_default().insert(
            addr,
            PeerRecord {
                meta,
                expires_at: expiry(ttl),
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::gen_node_id;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn value_round_trip_and_overwrite() {
        let store = MemoryStore::new();
        let cluster = gen_node_id();
        let key = gen_node_id();

        assert!(store.get(&cluster, &key).await.is_none());
        assert!(store.put(&cluster, &key, b"one".to_vec(), 60).await);
        let (value, ttl) = store.get(&cluster, &key).await.unwrap();
        assert_eq!(value, b"one");
        assert!(ttl <= 60);

        assert!(store.put(&cluster, &key, b"two".to_vec(), 60).await);
        assert_eq!(store.get(&cluster, &key).await.unwrap().0, b"two");
    }

    #[tokio::test]
    async fn values_are_cluster_scoped() {
        let store = MemoryStore::new();
        let key = gen_node_id();
        let a = gen_node_id();
        let b = gen_node_id();

        store.put(&a, &key, b"in-a".to_vec(), 0).await;
        assert!(store.get(&b, &key).await.is_none());
        assert_eq!(store.get(&a, &key).await.unwrap().0, b"in-a");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_values_disappear() {
        let store = MemoryStore::new();
        let cluster = gen_node_id();
        let key = gen_node_id();

        store.put(&cluster, &key, b"fleeting".to_vec(), 1).await;
        assert!(store.get(&cluster, &key).await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(&cluster, &key).await.is_none());
    }

    #[tokio::test]
    async fn name_generation_is_strictly_monotone() {
        let store = MemoryStore::new();
        let cluster = gen_node_id();
        let name = gen_node_id();

        assert!(store.put_name(&cluster, &name, b"g5".to_vec(), 5, 0).await);
        assert!(!store.put_name(&cluster, &name, b"g5b".to_vec(), 5, 0).await);
        assert!(!store.put_name(&cluster, &name, b"g4".to_vec(), 4, 0).await);
        assert!(store.put_name(&cluster, &name, b"g6".to_vec(), 6, 0).await);

        let (value, generation) = store.get_name(&cluster, &name).await.unwrap();
        assert_eq!(value, b"g6");
        assert_eq!(generation, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_name_frees_its_generation() {
        let store = MemoryStore::new();
        let cluster = gen_node_id();
        let name = gen_node_id();

        assert!(store.put_name(&cluster, &name, b"g9".to_vec(), 9, 1).await);
        tokio::time::advance(Duration::from_secs(2)).await;
        // The old generation no longer blocks a lower one once expired.
        assert!(store.put_name(&cluster, &name, b"g3".to_vec(), 3, 0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn announcements_accumulate_and_expire() {
        let store = MemoryStore::new();
        let cluster = gen_node_id();
        let hash = gen_node_id();

        store.announce(&cluster, &hash, addr(1000), None, 1).await;
        store
            .announce(&cluster, &hash, addr(2000), Some(b"m".to_vec()), 0)
            .await;
        assert_eq!(store.get_peers(&cluster, &hash).await.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        let peers = store.get_peers(&cluster, &hash).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr, addr(2000));
        assert_eq!(peers[0].meta.as_deref(), Some(b"m".as_slice()));
    }

    #[tokio::test]
    async fn reannounce_replaces_previous_entry() {
        let store = MemoryStore::new();
        let cluster = gen_node_id();
        let hash = gen_node_id();

        store.announce(&cluster, &hash, addr(3000), None, 0).await;
        store
            .announce(&cluster, &hash, addr(3000), Some(b"new".to_vec()), 0)
            .await;
        let peers = store.get_peers(&cluster, &hash).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].meta.as_deref(), Some(b"new".as_slice()));
    }
}
