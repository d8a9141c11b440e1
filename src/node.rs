//! # High-Level Node API
//!
//! A [`Dht`] is one node's membership in one cluster overlay: the sealed
//! UDP dispatcher, the routing-table actor, the search engine and the
//! maintenance timers, assembled behind a single handle.
//!
//! ```ignore
//! let dht = Dht::bind("0.0.0.0:4471".parse()?, None, keys, store, Timers::default()).await?;
//! dht.bootstrap(&[(peer_id, peer_addr)]).await;
//!
//! dht.put(key, b"value".to_vec(), 3600).await?;
//! let hit = dht.get(key).await;
//!
//! let (name, acks) = dht.put_name(&owner_key, b"profile".to_vec(), 7, 3600).await?;
//! let record = dht.get_name(name, 0).await;
//! ```
//!
//! Publishing signs records locally: immutable values under the cluster
//! write key, name records under the caller's owner key (plus the cluster
//! key when the cluster is write-gated). Reads verify ownership before a
//! record is returned.
//!
//! Shutdown cancels the maintenance timers, stops the routing actor, then
//! closes the socket; in-flight searches resolve with their timeouts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::SigningKey;
use tracing::{debug, info};

use crate::config::{jittered, ClusterKeys, Timers};
use crate::crypto;
use crate::identity::{gen_node_id, NodeId};
use crate::messages::{NameRecord, NodeInfo, PeerEntry};
use crate::routing::Routing;
use crate::search::{SearchConfig, Searcher};
use crate::server::ClusterServer;
use crate::storage::RecordStore;

/// A point-in-time view of the node, for logs and operators.
#[derive(Debug, Clone)]
pub struct DhtStats {
    pub peers: usize,
    pub buckets: usize,
}

/// One node in one cluster overlay.
pub struct Dht {
    raw_id: NodeId,
    keys: ClusterKeys,
    server: ClusterServer,
    routing: Routing,
    searcher: Searcher<ClusterServer>,
    store: Arc<dyn RecordStore>,
    maintenance: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Dht {
    /// Bind a node. `raw_id` defaults to a freshly generated id.
    pub async fn bind(
        bind: SocketAddr,
        raw_id: Option<NodeId>,
        keys: ClusterKeys,
        store: Arc<dyn RecordStore>,
        timers: Timers,
    ) -> Result<Self> {
        let raw_id = raw_id.unwrap_or_else(gen_node_id);
        let server =
            ClusterServer::bind(bind, raw_id, keys.clone(), store.clone(), timers.clone()).await?;
        let routing = Routing::spawn(raw_id, Arc::new(server.clone()), timers.clone());
        server.attach_routing(routing.clone());
        server.start();

        let searcher = Searcher::new(
            Arc::new(server.clone()),
            raw_id,
            SearchConfig::from_timers(&timers),
        );

        let dht = Self {
            raw_id,
            keys,
            server,
            routing,
            searcher,
            store,
            maintenance: Mutex::new(Vec::new()),
        };
        dht.spawn_maintenance(&timers);
        info!(
            id = %raw_id,
            addr = %dht.local_addr()?,
            "node up"
        );
        Ok(dht)
    }

    /// Neighbourhood and bucket refresh loops, each jittered so restarted
    /// clusters do not tick in lockstep.
    fn spawn_maintenance(&self, timers: &Timers) {
        let mut tasks = self.maintenance.lock().unwrap();

        let routing = self.routing.clone();
        let searcher = self.searcher.clone();
        let interval = timers.neighbourhood_interval;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(interval)).await;
                let Some(target) = routing.neighbourhood_target().await else {
                    break;
                };
                let seeds = routing.closest(target, None).await;
                if seeds.is_empty() {
                    continue;
                }
                debug!("neighbourhood refresh");
                searcher.find_node(target, seeds).await;
            }
        }));

        let routing = self.routing.clone();
        let searcher = self.searcher.clone();
        let interval = timers.bucket_interval;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(interval)).await;
                for target in routing.refresh_targets().await {
                    let seeds = routing.closest(target, None).await;
                    if seeds.is_empty() {
                        continue;
                    }
                    debug!("bucket refresh");
                    searcher.find_node(target, seeds).await;
                }
            }
        }));
    }

    pub fn id(&self) -> NodeId {
        self.raw_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub async fn stats(&self) -> DhtStats {
        let (peers, buckets) = self.routing.len().await;
        DhtStats { peers, buckets }
    }

    /// Join the overlay through known peers: ping each, then walk toward our
    /// own id to populate the nearby buckets. Returns the routing-table size
    /// afterwards.
    pub async fn bootstrap(&self, peers: &[(NodeId, SocketAddr)]) -> usize {
        let mut seeds = Vec::new();
        for (id, addr) in peers {
            if self.server_ping(*addr).await {
                seeds.push(NodeInfo {
                    id: *id,
                    addr: *addr,
                });
            }
        }
        if !seeds.is_empty() {
            self.searcher
                .find_node(self.raw_id.hashed(), seeds)
                .await;
        }
        let (peers, _) = self.routing.len().await;
        peers
    }

    async fn server_ping(&self, addr: SocketAddr) -> bool {
        use crate::protocols::ClusterRpc;
        match self.server.ping(addr).await {
            Ok(_) => true,
            Err(e) => {
                debug!(%addr, error = %e, "bootstrap ping failed");
                false
            }
        }
    }

    async fn seeds_toward(&self, target: NodeId) -> Vec<NodeInfo> {
        self.routing.closest(target, None).await
    }

    /// Locate the k closest live peers to `target` (hashed id space).
    pub async fn find_node(&self, target: NodeId) -> Vec<NodeInfo> {
        let seeds = self.seeds_toward(target).await;
        self.searcher.find_node(target, seeds).await
    }

    /// Retrieve an immutable value, local storage first.
    pub async fn get(&self, key: NodeId) -> Option<(Vec<u8>, u64)> {
        if let Some(hit) = self.store.get(&self.keys.id, &key).await {
            return Some(hit);
        }
        let seeds = self.seeds_toward(key).await;
        self.searcher.find_value(key, seeds).await
    }

    /// Publish an immutable value: sign under the cluster write key, keep a
    /// local copy, fan the write out to the key's neighbourhood. Returns how
    /// many peers acknowledged.
    pub async fn put(&self, key: NodeId, value: Vec<u8>, ttl: u64) -> Result<usize> {
        let sig = match (&self.keys.public_key, &self.keys.private_key) {
            (Some(_), Some(private)) => {
                crypto::sign(private, &crypto::value_signable(&key, &value, ttl)).to_vec()
            }
            (Some(_), None) => {
                return Err(anyhow!("cluster is write-gated and no write key is loaded"))
            }
            (None, _) => Vec::new(),
        };

        self.store
            .put(&self.keys.id, &key, value.clone(), ttl)
            .await;
        let seeds = self.seeds_toward(key).await;
        Ok(self.searcher.store_value(key, value, ttl, sig, seeds).await)
    }

    /// Retrieve a name record at `min_generation` or newer. Ownership is
    /// verified before the record is surfaced.
    pub async fn get_name(&self, name: NodeId, min_generation: u64) -> Option<NameRecord> {
        if let Some((bytes, generation)) = self.store.get_name(&self.keys.id, &name).await {
            if generation >= min_generation {
                if let Ok(record) = crate::messages::decode_name_record(&bytes) {
                    return Some(record);
                }
            }
        }
        let seeds = self.seeds_toward(name).await;
        self.searcher.find_name(name, min_generation, seeds).await
    }

    /// Publish a mutable name record owned by `owner`. The record's name is
    /// derived from the owner key; the generation must exceed whatever the
    /// overlay already holds for the write to land.
    pub async fn put_name(
        &self,
        owner: &SigningKey,
        value: Vec<u8>,
        generation: u64,
        ttl: u64,
    ) -> Result<(NodeId, usize)> {
        let public = owner.verifying_key().to_bytes().to_vec();
        let name = crypto::name_from_key(&public);

        let sig_owner =
            crypto::sign(owner, &crypto::name_owner_signable(&name, &value, generation)).to_vec();
        let sig_cluster = match (&self.keys.public_key, &self.keys.private_key) {
            (Some(_), Some(private)) => crypto::sign(
                private,
                &crypto::name_cluster_signable(&name, &value, generation, ttl),
            )
            .to_vec(),
            (Some(_), None) => {
                return Err(anyhow!("cluster is write-gated and no write key is loaded"))
            }
            (None, _) => Vec::new(),
        };

        let record = NameRecord {
            value,
            generation,
            ttl,
            owner: public,
            sig_cluster,
            sig_owner,
        };

        let bytes = crate::messages::encode_name_record(&record).context("record encode")?;
        self.store
            .put_name(&self.keys.id, &name, bytes, generation, ttl)
            .await;

        let seeds = self.seeds_toward(name).await;
        let acks = self.searcher.store_name(name, record, seeds).await;
        Ok((name, acks))
    }

    /// Collect peers announced under an info hash.
    pub async fn get_peers(&self, info_hash: NodeId) -> Vec<PeerEntry> {
        let seeds = self.seeds_toward(info_hash).await;
        self.searcher.get_peers(info_hash, seeds).await
    }

    /// Announce this node under an info hash.
    pub async fn announce(
        &self,
        info_hash: NodeId,
        port: Option<u16>,
        meta: Option<Vec<u8>>,
        ttl: u64,
    ) -> usize {
        let seeds = self.seeds_toward(info_hash).await;
        self.searcher
            .announce(info_hash, port, meta, ttl, seeds)
            .await
    }

    /// Cancel timers, stop the routing actor, close the socket.
    pub async fn shutdown(&self) {
        for task in self.maintenance.lock().unwrap().drain(..) {
            task.abort();
        }
        self.routing.shutdown().await;
        self.server.shutdown();
    }
}
