//! # Routing Table
//!
//! Kademlia bucket structure over hashed node ids, owned by a single actor
//! task. Everything mutable lives inside [`RoutingActor`]; the rest of the
//! crate holds a cheap [`Routing`] handle and talks over channels.
//!
//! ## Placement
//!
//! A peer's bucket is the length of the common bit prefix between its hashed
//! id and ours, clamped to the last bucket. The table starts with one bucket
//! covering the whole space; only the last bucket may split. A full bucket
//! that cannot split simply rejects newcomers; peers far from us are cheap
//! to rediscover.
//!
//! ## Liveness
//!
//! Each peer carries a `last_responded` stamp and a goodness flag. A review
//! sweep pings everyone: peers silent beyond the threshold are downgraded
//! Good → Questionable, and a still-silent Questionable peer is evicted on
//! the next sweep. Maintenance lookups (self neighbourhood, stale or thin
//! buckets) are driven by the node facade, which asks the actor for refresh
//! targets.

use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::{jittered, Timers};
use crate::identity::{bucket_index, distance_cmp, random_id_in_bucket, NodeId, ID_BITS};
use crate::messages::NodeInfo;
use crate::protocols::ClusterRpc;

/// Bucket capacity, the `k` of the overlay.
pub const BUCKET_SIZE: usize = 8;

/// A bucket below this many peers is refreshed even when recently updated.
pub const BUCKET_LOW_WATER: usize = 6;

/// Liveness classification of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goodness {
    Good,
    Questionable,
}

/// One peer of the overlay as the routing table sees it.
#[derive(Debug, Clone)]
pub struct Peer {
    pub raw_id: NodeId,
    pub hashed_id: NodeId,
    pub addr: SocketAddr,
    last_responded: Instant,
    goodness: Goodness,
}

impl Peer {
    fn new(raw_id: NodeId, addr: SocketAddr) -> Self {
        Self {
            raw_id,
            hashed_id: raw_id.hashed(),
            addr,
            last_responded: Instant::now(),
            goodness: Goodness::Good,
        }
    }

    pub fn goodness(&self) -> Goodness {
        self.goodness
    }

    /// Time since the peer last answered anything.
    pub fn idle(&self) -> Duration {
        self.last_responded.elapsed()
    }

    fn mark_responded(&mut self) {
        self.goodness = Goodness::Good;
        self.last_responded = Instant::now();
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.raw_id,
            addr: self.addr,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    peers: Vec<Peer>,
    last_updated: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            peers: Vec::with_capacity(BUCKET_SIZE),
            last_updated: Instant::now(),
        }
    }

    fn is_full(&self) -> bool {
        self.peers.len() >= BUCKET_SIZE
    }

    fn age(&self) -> Duration {
        self.last_updated.elapsed()
    }

    fn touch(&mut self) {
        self.last_updated = Instant::now();
    }

    fn push(&mut self, peer: Peer) {
        self.peers.push(peer);
        self.touch();
    }

    fn remove(&mut self, hashed: &NodeId) -> Option<Peer> {
        let pos = self.peers.iter().position(|p| &p.hashed_id == hashed)?;
        Some(self.peers.remove(pos))
    }
}

/// Result of offering a peer to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The candidate is this node itself.
    SelfId,
    /// The hashed id is already present.
    Duplicate,
    /// Target bucket full and not allowed to split.
    Full,
}

/// The bucket list plus the address index. Pure data structure; the actor
/// below owns the only instance.
pub struct RoutingTable {
    self_raw: NodeId,
    self_hashed: NodeId,
    buckets: Vec<Bucket>,
    by_addr: HashMap<SocketAddr, NodeId>,
}

impl RoutingTable {
    pub fn new(self_raw: NodeId) -> Self {
        Self {
            self_raw,
            self_hashed: self_raw.hashed(),
            buckets: vec![Bucket::new()],
            by_addr: HashMap::new(),
        }
    }

    pub fn self_hashed(&self) -> NodeId {
        self.self_hashed
    }

    fn last_index(&self) -> usize {
        self.buckets.len() - 1
    }

    /// Bucket a hashed id belongs to, clamped to the last existing bucket.
    fn bucket_for(&self, hashed: &NodeId) -> usize {
        bucket_index(&self.self_hashed, hashed).min(self.last_index())
    }

    /// Offer a freshly seen peer. Splits the last bucket as needed.
    pub fn insert(&mut self, raw_id: NodeId, addr: SocketAddr) -> InsertOutcome {
        if raw_id == self.self_raw {
            return InsertOutcome::SelfId;
        }
        let hashed = raw_id.hashed();
        if self.get(&hashed).is_some() {
            return InsertOutcome::Duplicate;
        }
        // A peer that rebinds its address keeps exactly one entry in each
        // index; the stale record at this address goes first.
        if let Some(old) = self.by_addr.get(&addr).copied() {
            self.delete(&old);
        }

        loop {
            let idx = self.bucket_for(&hashed);
            let bucket = &mut self.buckets[idx];
            if !bucket.is_full() {
                trace!(peer = %raw_id, bucket = idx, "routing insert");
                bucket.push(Peer::new(raw_id, addr));
                self.by_addr.insert(addr, hashed);
                return InsertOutcome::Inserted;
            }
            if idx != self.last_index() || self.buckets.len() >= ID_BITS {
                return InsertOutcome::Full;
            }
            self.split_last();
        }
    }

    /// Append a bucket and move every peer of the old last bucket that now
    /// has a longer shared prefix into it.
    fn split_last(&mut self) {
        let old_last = self.last_index();
        self.buckets.push(Bucket::new());
        let moved: Vec<Peer> = {
            let bucket = &mut self.buckets[old_last];
            let (stay, moved) = std::mem::take(&mut bucket.peers)
                .into_iter()
                .partition(|p| bucket_index(&self.self_hashed, &p.hashed_id) == old_last);
            bucket.peers = stay;
            moved
        };
        debug!(
            buckets = self.buckets.len(),
            moved = moved.len(),
            "split last bucket"
        );
        for peer in moved {
            self.buckets[old_last + 1].push(peer);
        }
    }

    pub fn get(&self, hashed: &NodeId) -> Option<&Peer> {
        let idx = self.bucket_for(hashed);
        self.buckets[idx].peers.iter().find(|p| &p.hashed_id == hashed)
    }

    fn get_mut(&mut self, hashed: &NodeId) -> Option<&mut Peer> {
        let idx = self.bucket_for(hashed);
        self.buckets[idx]
            .peers
            .iter_mut()
            .find(|p| &p.hashed_id == hashed)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&Peer> {
        let hashed = self.by_addr.get(addr)?;
        self.get(hashed)
    }

    /// Remove a peer from its bucket and the address index.
    pub fn delete(&mut self, hashed: &NodeId) -> bool {
        let idx = self.bucket_for(hashed);
        match self.buckets[idx].remove(hashed) {
            Some(peer) => {
                self.by_addr.remove(&peer.addr);
                true
            }
            None => false,
        }
    }

    /// Stamp a response from a peer, reviving a Questionable one.
    pub fn mark_responded(&mut self, hashed: &NodeId) -> bool {
        match self.get_mut(hashed) {
            Some(peer) => {
                peer.mark_responded();
                true
            }
            None => false,
        }
    }

    /// The up-to-k peers nearest `target` in XOR distance of hashed ids,
    /// ascending, optionally excluding one hashed id.
    pub fn closest(&self, target: &NodeId, exclude: Option<&NodeId>) -> Vec<NodeInfo> {
        struct Entry {
            dist: [u8; 32],
            hashed: NodeId,
            info: NodeInfo,
        }
        impl PartialEq for Entry {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist && self.hashed == other.hashed
            }
        }
        impl Eq for Entry {}
        impl Ord for Entry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
                    .then_with(|| self.hashed.as_bytes().cmp(other.hashed.as_bytes()))
            }
        }
        impl PartialOrd for Entry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Entry> = BinaryHeap::with_capacity(BUCKET_SIZE + 1);
        for bucket in &self.buckets {
            for peer in &bucket.peers {
                if exclude == Some(&peer.hashed_id) {
                    continue;
                }
                let entry = Entry {
                    dist: peer.hashed_id.xor_distance(target),
                    hashed: peer.hashed_id,
                    info: peer.info(),
                };
                if heap.len() < BUCKET_SIZE {
                    heap.push(entry);
                } else if let Some(farthest) = heap.peek() {
                    if entry.cmp(farthest) == std::cmp::Ordering::Less {
                        heap.push(entry);
                        heap.pop();
                    }
                }
            }
        }

        let mut entries: Vec<Entry> = heap.into_vec();
        entries.sort();
        entries.into_iter().map(|e| e.info).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.buckets.iter().flat_map(|b| b.peers.iter())
    }

    /// Refresh targets for buckets that are stale or underfilled; stamps the
    /// chosen buckets so the next sweep skips them.
    fn refresh_targets(&mut self, max_idle: Duration) -> Vec<NodeId> {
        let self_hashed = self.self_hashed;
        let mut targets = Vec::new();
        for (idx, bucket) in self.buckets.iter_mut().enumerate() {
            if bucket.age() >= max_idle || bucket.peers.len() < BUCKET_LOW_WATER {
                targets.push(random_id_in_bucket(&self_hashed, idx));
                bucket.touch();
            }
        }
        targets
    }
}

/// A peer snapshot handed across the actor boundary.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub raw_id: NodeId,
    pub hashed_id: NodeId,
    pub addr: SocketAddr,
    pub goodness: Goodness,
    pub idle: Duration,
}

impl PeerView {
    fn of(peer: &Peer) -> Self {
        Self {
            raw_id: peer.raw_id,
            hashed_id: peer.hashed_id,
            addr: peer.addr,
            goodness: peer.goodness(),
            idle: peer.idle(),
        }
    }
}

enum RoutingCmd {
    Insert(NodeId, SocketAddr),
    Responded(NodeId),
    Closest(NodeId, Option<NodeId>, oneshot::Sender<Vec<NodeInfo>>),
    Get(NodeId, oneshot::Sender<Option<PeerView>>),
    GetByAddr(SocketAddr, oneshot::Sender<Option<PeerView>>),
    Delete(NodeId),
    Len(oneshot::Sender<(usize, usize)>),
    RefreshTargets(oneshot::Sender<Vec<NodeId>>),
    NeighbourhoodTarget(oneshot::Sender<NodeId>),
    Shutdown,
}

/// Handle to the routing-table actor. Cheap to clone.
#[derive(Clone)]
pub struct Routing {
    cmd_tx: mpsc::Sender<RoutingCmd>,
}

impl Routing {
    /// Spawn the owner task. `net` dispatches the liveness pings.
    pub fn spawn<N: ClusterRpc>(self_raw: NodeId, net: Arc<N>, timers: Timers) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let actor = RoutingActor {
            table: RoutingTable::new(self_raw),
            net,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            timers,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    /// Offer a peer seen on the wire.
    pub async fn insert(&self, raw_id: NodeId, addr: SocketAddr) {
        let _ = self.cmd_tx.send(RoutingCmd::Insert(raw_id, addr)).await;
    }

    /// Record that a peer answered something.
    pub async fn responded(&self, raw_id: NodeId) {
        let _ = self.cmd_tx.send(RoutingCmd::Responded(raw_id)).await;
    }

    /// The k closest peers to `target`, optionally excluding a hashed id.
    pub async fn closest(&self, target: NodeId, exclude: Option<NodeId>) -> Vec<NodeInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCmd::Closest(target, exclude, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get(&self, hashed: NodeId) -> Option<PeerView> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RoutingCmd::Get(hashed, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn get_by_addr(&self, addr: SocketAddr) -> Option<PeerView> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCmd::GetByAddr(addr, tx))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn delete(&self, hashed: NodeId) {
        let _ = self.cmd_tx.send(RoutingCmd::Delete(hashed)).await;
    }

    /// `(peer count, bucket count)`.
    pub async fn len(&self) -> (usize, usize) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RoutingCmd::Len(tx)).await.is_err() {
            return (0, 0);
        }
        rx.await.unwrap_or((0, 0))
    }

    /// Targets for buckets due a refresh lookup.
    pub async fn refresh_targets(&self) -> Vec<NodeId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCmd::RefreshTargets(tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// A random id in the range of our own bucket.
    pub async fn neighbourhood_target(&self) -> Option<NodeId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoutingCmd::NeighbourhoodTarget(tx))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RoutingCmd::Shutdown).await;
    }
}

struct RoutingActor<N: ClusterRpc> {
    table: RoutingTable,
    net: Arc<N>,
    cmd_rx: mpsc::Receiver<RoutingCmd>,
    cmd_tx: mpsc::Sender<RoutingCmd>,
    timers: Timers,
}

impl<N: ClusterRpc> RoutingActor<N> {
    async fn run(mut self) {
        let mut next_review = Instant::now() + jittered(self.timers.review_interval);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(RoutingCmd::Shutdown) | None => break,
                        Some(cmd) => self.handle(cmd),
                    }
                }
                _ = tokio::time::sleep_until(next_review) => {
                    self.review();
                    next_review = Instant::now() + jittered(self.timers.review_interval);
                }
            }
        }
        debug!("routing actor stopped");
    }

    fn handle(&mut self, cmd: RoutingCmd) {
        match cmd {
            RoutingCmd::Insert(raw, addr) => {
                self.table.insert(raw, addr);
            }
            RoutingCmd::Responded(raw) => {
                self.table.mark_responded(&raw.hashed());
            }
            RoutingCmd::Closest(target, exclude, reply) => {
                let _ = reply.send(self.table.closest(&target, exclude.as_ref()));
            }
            RoutingCmd::Get(hashed, reply) => {
                let _ = reply.send(self.table.get(&hashed).map(PeerView::of));
            }
            RoutingCmd::GetByAddr(addr, reply) => {
                let _ = reply.send(self.table.get_by_addr(&addr).map(PeerView::of));
            }
            RoutingCmd::Delete(hashed) => {
                self.table.delete(&hashed);
            }
            RoutingCmd::Len(reply) => {
                let _ = reply.send((self.table.len(), self.table.bucket_count()));
            }
            RoutingCmd::RefreshTargets(reply) => {
                let _ = reply.send(self.table.refresh_targets(self.timers.bucket_max_idle));
            }
            RoutingCmd::NeighbourhoodTarget(reply) => {
                let idx = self.table.last_index();
                let _ = reply.send(random_id_in_bucket(&self.table.self_hashed, idx));
            }
            RoutingCmd::Shutdown => unreachable!("handled in run"),
        }
    }

    /// One liveness sweep: ping the living, downgrade the silent, evict the
    /// silent-and-already-questionable.
    fn review(&mut self) {
        let threshold = self.timers.liveness_threshold;
        let mut evict = Vec::new();
        let mut ping = Vec::new();

        for peer in self.table.peers() {
            if peer.idle() < threshold {
                ping.push(peer.addr);
            } else if peer.goodness() == Goodness::Good {
                ping.push(peer.addr);
            } else {
                evict.push(peer.hashed_id);
            }
        }

        // Downgrade pass runs after the scan so the borrow above stays shared.
        let stale: Vec<NodeId> = self
            .table
            .peers()
            .filter(|p| p.idle() >= threshold && p.goodness() == Goodness::Good)
            .map(|p| p.hashed_id)
            .collect();
        for hashed in stale {
            if let Some(peer) = self.table.get_mut(&hashed) {
                peer.goodness = Goodness::Questionable;
            }
        }

        for hashed in &evict {
            self.table.delete(hashed);
        }
        if !evict.is_empty() {
            debug!(evicted = evict.len(), remaining = self.table.len(), "review sweep");
        }

        for addr in ping {
            let net = self.net.clone();
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                if let Ok(raw) = net.ping(addr).await {
                    let _ = tx.send(RoutingCmd::Responded(raw)).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::gen_node_id;
    use crate::messages::{NameRecord, NodeInfo};
    use crate::protocols::{NameOutcome, PeersOutcome, ValueOutcome};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Raw id whose *hashed* form has the requested first bits, found by
    /// search. Slow but fine for the small counts tests use.
    fn raw_with_hashed_prefix(self_hashed: &NodeId, shared_bits: usize) -> NodeId {
        loop {
            let raw = gen_node_id();
            if bucket_index(self_hashed, &raw.hashed()) == shared_bits {
                return raw;
            }
        }
    }

    #[test]
    fn never_stores_self_or_duplicates() {
        let self_raw = gen_node_id();
        let mut table = RoutingTable::new(self_raw);

        assert_eq!(table.insert(self_raw, addr(1)), InsertOutcome::SelfId);

        let peer = gen_node_id();
        assert_eq!(table.insert(peer, addr(2)), InsertOutcome::Inserted);
        assert_eq!(table.insert(peer, addr(3)), InsertOutcome::Duplicate);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn buckets_never_exceed_capacity() {
        let mut table = RoutingTable::new(gen_node_id());
        for i in 0..200 {
            table.insert(gen_node_id(), addr(1000 + i));
        }
        for bucket in &table.buckets {
            assert!(bucket.peers.len() <= BUCKET_SIZE);
        }
    }

    #[test]
    fn non_last_buckets_hold_exact_prefix() {
        let mut table = RoutingTable::new(gen_node_id());
        for i in 0..300 {
            table.insert(gen_node_id(), addr(2000 + i));
        }
        let last = table.last_index();
        for (idx, bucket) in table.buckets.iter().enumerate() {
            if idx == last {
                continue;
            }
            for peer in &bucket.peers {
                assert_eq!(bucket_index(&table.self_hashed, &peer.hashed_id), idx);
            }
        }
    }

    #[test]
    fn split_when_last_bucket_overflows() {
        let self_raw = gen_node_id();
        let self_hashed = self_raw.hashed();
        let mut table = RoutingTable::new(self_raw);

        // Nine peers whose hashed ids differ from ours in the first bit all
        // contend for the first bucket.
        for i in 0..8 {
            let raw = raw_with_hashed_prefix(&self_hashed, 0);
            assert_eq!(table.insert(raw, addr(3000 + i)), InsertOutcome::Inserted);
        }
        assert_eq!(table.bucket_count(), 1);
        assert_eq!(table.len(), 8);

        // The ninth forces the split; its home bucket is then full and no
        // longer last, so it is dropped.
        let ninth = raw_with_hashed_prefix(&self_hashed, 0);
        assert_eq!(table.insert(ninth, addr(3100)), InsertOutcome::Full);
        assert_eq!(table.bucket_count(), 2);
        assert_eq!(table.len(), 8);

        // A peer sharing one leading bit now has a home of its own.
        let closer = raw_with_hashed_prefix(&self_hashed, 1);
        assert_eq!(table.insert(closer, addr(3200)), InsertOutcome::Inserted);
        assert_eq!(table.get(&closer.hashed()).unwrap().addr, addr(3200));
    }

    #[test]
    fn closest_is_sorted_and_honors_exclusion() {
        let mut table = RoutingTable::new(gen_node_id());
        let mut raws = Vec::new();
        for i in 0..40 {
            let raw = gen_node_id();
            raws.push(raw);
            table.insert(raw, addr(4000 + i));
        }

        let target = gen_node_id();
        let closest = table.closest(&target, None);
        assert!(closest.len() <= BUCKET_SIZE);
        for pair in closest.windows(2) {
            let da = pair[0].id.hashed().xor_distance(&target);
            let db = pair[1].id.hashed().xor_distance(&target);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }

        let excluded = closest[0].id.hashed();
        let without = table.closest(&target, Some(&excluded));
        assert!(without.iter().all(|n| n.id.hashed() != excluded));
    }

    #[test]
    fn delete_clears_both_indexes() {
        let mut table = RoutingTable::new(gen_node_id());
        let raw = gen_node_id();
        table.insert(raw, addr(5000));

        assert!(table.get(&raw.hashed()).is_some());
        assert!(table.get_by_addr(&addr(5000)).is_some());

        assert!(table.delete(&raw.hashed()));
        assert!(table.get(&raw.hashed()).is_none());
        assert!(table.get_by_addr(&addr(5000)).is_none());
        assert!(!table.delete(&raw.hashed()));
    }

    #[test]
    fn rebound_address_replaces_stale_peer() {
        let mut table = RoutingTable::new(gen_node_id());
        let old = gen_node_id();
        let new = gen_node_id();
        table.insert(old, addr(6000));
        table.insert(new, addr(6000));

        assert!(table.get(&old.hashed()).is_none());
        assert_eq!(table.get_by_addr(&addr(6000)).unwrap().raw_id, new);
        assert_eq!(table.len(), 1);
    }

    /// Network stub whose pings always fail; nothing else is exercised.
    struct DeadNet;

    #[async_trait]
    impl ClusterRpc for DeadNet {
        async fn ping(&self, _to: SocketAddr) -> Result<NodeId> {
            Err(anyhow!("unreachable"))
        }
        async fn find_node(&self, _to: &NodeInfo, _target: NodeId) -> Result<Vec<NodeInfo>> {
            Err(anyhow!("unused"))
        }
        async fn find_value(&self, _to: &NodeInfo, _key: NodeId) -> Result<ValueOutcome> {
            Err(anyhow!("unused"))
        }
        async fn find_name(
            &self,
            _to: &NodeInfo,
            _name: NodeId,
            _generation: u64,
        ) -> Result<NameOutcome> {
            Err(anyhow!("unused"))
        }
        async fn get_peers(&self, _to: &NodeInfo, _info_hash: NodeId) -> Result<PeersOutcome> {
            Err(anyhow!("unused"))
        }
        async fn store(
            &self,
            _to: &NodeInfo,
            _key: NodeId,
            _value: Vec<u8>,
            _ttl: u64,
            _sig: Vec<u8>,
            _token: Vec<u8>,
        ) -> Result<bool> {
            Err(anyhow!("unused"))
        }
        async fn store_name(
            &self,
            _to: &NodeInfo,
            _name: NodeId,
            _record: NameRecord,
            _token: Vec<u8>,
        ) -> Result<bool> {
            Err(anyhow!("unused"))
        }
        async fn announce_peer(
            &self,
            _to: &NodeInfo,
            _info_hash: NodeId,
            _port: Option<u16>,
            _meta: Option<Vec<u8>>,
            _token: Vec<u8>,
            _ttl: u64,
        ) -> Result<bool> {
            Err(anyhow!("unused"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_downgraded_then_evicted() {
        let timers = Timers {
            review_interval: Duration::from_secs(10),
            liveness_threshold: Duration::from_secs(30),
            ..Timers::default()
        };
        let routing = Routing::spawn(gen_node_id(), Arc::new(DeadNet), timers);

        let raw = gen_node_id();
        routing.insert(raw, addr(7000)).await;
        assert!(routing.get(raw.hashed()).await.is_some());

        // Step past the threshold plus two jittered review sweeps: the
        // first downgrades, the second evicts.
        for _ in 0..12 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }

        assert!(routing.get(raw.hashed()).await.is_none());
        assert!(routing.get_by_addr(addr(7000)).await.is_none());
        routing.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn responded_peer_survives_reviews() {
        let timers = Timers {
            review_interval: Duration::from_secs(10),
            liveness_threshold: Duration::from_secs(30),
            ..Timers::default()
        };
        let routing = Routing::spawn(gen_node_id(), Arc::new(DeadNet), timers);

        let raw = gen_node_id();
        routing.insert(raw, addr(7100)).await;

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(15)).await;
            routing.responded(raw).await;
        }

        let view = routing.get(raw.hashed()).await.unwrap();
        assert_eq!(view.goodness, Goodness::Good);
        routing.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_targets_cover_thin_buckets() {
        let routing = Routing::spawn(gen_node_id(), Arc::new(DeadNet), Timers::default());
        // One bucket, underfilled: one target in its range.
        routing.insert(gen_node_id(), addr(7200)).await;
        let targets = routing.refresh_targets().await;
        assert_eq!(targets.len(), 1);
        routing.shutdown().await;
    }
}
