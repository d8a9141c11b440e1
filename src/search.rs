//! # Iterative Search Engine
//!
//! One engine drives all seven lookup kinds. A search keeps a shortlist of
//! candidates ordered by XOR distance to the target, asks the closest
//! unqueried α of them in parallel, merges whatever nodes they return, and
//! repeats until it converges, finds what it wanted, or runs out of road.
//!
//! | Kind | Phase 1 | Terminates on |
//! |------|---------|---------------|
//! | `find_node` | node iteration | best-k stable |
//! | `find_value` / `find_name` / `get_peers` | node iteration | first hit, or shortlist exhausted |
//! | `store` / `store_name` / `announce` | node iteration | phase 2: write fanned out to best-k |
//!
//! Rules the engine holds itself to: a peer is queried at most once per
//! search; a query timeout never fails the search; distances compare on
//! hashed ids with lexicographic tie-breaks; the shortlist is capped so a
//! hostile responder cannot balloon memory. Every search observes a global
//! deadline on top of the per-query timeout.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::Timers;
use crate::crypto::{self, name_owner_signable};
use crate::identity::{distance_cmp, NodeId, ID_LEN};
use crate::messages::{NameRecord, NodeInfo, PeerEntry};
use crate::protocols::{ClusterRpc, NameOutcome, PeersOutcome, ValueOutcome};
use crate::routing::BUCKET_SIZE;

/// Parallelism of one search round.
pub const ALPHA: usize = 3;

/// Shortlist cap: about k·log₂(N) for any overlay we expect to meet.
const KNOWN_CAP: usize = 256;

/// Hard cap on rounds, a backstop under the global deadline.
const MAX_ROUNDS: usize = 32;

/// Tunables of one search.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub alpha: usize,
    pub k: usize,
    pub query_timeout: Duration,
    pub deadline: Duration,
}

impl SearchConfig {
    pub fn from_timers(timers: &Timers) -> Self {
        Self {
            alpha: ALPHA,
            k: BUCKET_SIZE,
            query_timeout: timers.query_timeout,
            deadline: timers.search_deadline,
        }
    }
}

/// What one answered query contributes to the iteration.
enum QueryStep<T> {
    /// Closer nodes, plus the responder's write token when the reply had one.
    Nodes(Vec<NodeInfo>, Option<Vec<u8>>),
    /// The thing we were looking for; the search stops here.
    Hit(T),
}

#[derive(Clone)]
struct Candidate {
    info: NodeInfo,
    hashed: NodeId,
    dist: [u8; ID_LEN],
}

impl Candidate {
    fn new(info: NodeInfo, hashed: NodeId, target: &NodeId) -> Self {
        let dist = hashed.xor_distance(target);
        Self { info, hashed, dist }
    }
}

fn sort_candidates(list: &mut [Candidate]) {
    list.sort_by(|a, b| {
        distance_cmp(&a.dist, &b.dist).then_with(|| a.hashed.as_bytes().cmp(b.hashed.as_bytes()))
    });
}

/// Whether iteration may stop early once the best-k frontier is stable.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Stop when k peers replied and nothing unqueried is closer.
    Converge,
    /// Keep going until the shortlist is exhausted (hit searches).
    Exhaust,
}

/// Everything an iteration learned.
struct Iteration<T> {
    hit: Option<T>,
    /// Replied peers, ascending by distance, at most k.
    best: Vec<NodeInfo>,
    /// Write tokens returned by repliers, keyed by hashed id.
    tokens: HashMap<NodeId, Vec<u8>>,
}

/// Runs searches for one cluster over a [`ClusterRpc`] transport.
pub struct Searcher<N> {
    net: Arc<N>,
    self_hashed: NodeId,
    config: SearchConfig,
}

impl<N> Clone for Searcher<N> {
    fn clone(&self) -> Self {
        Self {
            net: self.net.clone(),
            self_hashed: self.self_hashed,
            config: self.config.clone(),
        }
    }
}

impl<N: ClusterRpc> Searcher<N> {
    pub fn new(net: Arc<N>, self_raw: NodeId, config: SearchConfig) -> Self {
        Self {
            net,
            self_hashed: self_raw.hashed(),
            config,
        }
    }

    /// The core loop shared by every search kind.
    async fn iterate<T, F, Fut>(
        &self,
        target: NodeId,
        seeds: Vec<NodeInfo>,
        mode: Mode,
        query: F,
    ) -> Iteration<T>
    where
        F: Fn(NodeInfo) -> Fut,
        Fut: Future<Output = anyhow::Result<QueryStep<T>>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let mut shortlist: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut replied: Vec<Candidate> = Vec::new();
        let mut tokens: HashMap<NodeId, Vec<u8>> = HashMap::new();

        for info in seeds {
            let hashed = info.id.hashed();
            if hashed == self.self_hashed || !seen.insert(hashed) {
                continue;
            }
            shortlist.push(Candidate::new(info, hashed, &target));
        }
        sort_candidates(&mut shortlist);

        let mut rounds = 0;
        let hit = 'outer: loop {
            rounds += 1;
            if rounds > MAX_ROUNDS || started.elapsed() >= self.config.deadline {
                debug!(
                    target = %hex_prefix(&target),
                    rounds,
                    elapsed_ms = started.elapsed().as_millis(),
                    "search hit its bounds"
                );
                break None;
            }

            let candidates: Vec<Candidate> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.hashed))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break None;
            }

            if mode == Mode::Converge && replied.len() >= self.config.k {
                let farthest = &replied[self.config.k - 1].dist;
                let closer_waiting = candidates
                    .iter()
                    .any(|c| distance_cmp(&c.dist, farthest) == std::cmp::Ordering::Less);
                if !closer_waiting {
                    break None;
                }
            }

            for c in &candidates {
                queried.insert(c.hashed);
            }

            let mut round = JoinSet::new();
            for cand in candidates {
                let fut = query(cand.info.clone());
                let timeout = self.config.query_timeout;
                round.spawn(async move { (cand, tokio::time::timeout(timeout, fut).await) });
            }

            while let Some(joined) = round.join_next().await {
                let Ok((cand, outcome)) = joined else { continue };
                match outcome {
                    Ok(Ok(QueryStep::Hit(value))) => {
                        // Dropping the round aborts the remaining queries.
                        break 'outer Some(value);
                    }
                    Ok(Ok(QueryStep::Nodes(nodes, token))) => {
                        if !replied.iter().any(|c| c.hashed == cand.hashed) {
                            replied.push(cand.clone());
                            sort_candidates(&mut replied);
                        }
                        if let Some(token) = token {
                            tokens.insert(cand.hashed, token);
                        }
                        for info in nodes {
                            let hashed = info.id.hashed();
                            if hashed == self.self_hashed || !seen.insert(hashed) {
                                continue;
                            }
                            shortlist.push(Candidate::new(info, hashed, &target));
                        }
                    }
                    // Timeouts and query errors shrink nothing but this
                    // round; the peer is simply not asked again.
                    Ok(Err(e)) => trace!(peer = ?cand.info.addr, error = %e, "query failed"),
                    Err(_) => trace!(peer = ?cand.info.addr, "query timed out"),
                }
            }

            sort_candidates(&mut shortlist);
            shortlist.truncate(KNOWN_CAP);
        };

        replied.truncate(self.config.k);
        Iteration {
            hit,
            best: replied.into_iter().map(|c| c.info).collect(),
            tokens,
        }
    }

    /// Locate the k closest live peers to `target`.
    pub async fn find_node(&self, target: NodeId, seeds: Vec<NodeInfo>) -> Vec<NodeInfo> {
        let net = self.net.clone();
        let out = self
            .iterate(target, seeds, Mode::Converge, move |to| {
                let net = net.clone();
                async move {
                    let nodes = net.find_node(&to, target).await?;
                    Ok(QueryStep::<()>::Nodes(nodes, None))
                }
            })
            .await;
        out.best
    }

    /// Retrieve an immutable value. `None` is the ordinary not-found result.
    pub async fn find_value(&self, key: NodeId, seeds: Vec<NodeInfo>) -> Option<(Vec<u8>, u64)> {
        let net = self.net.clone();
        let out = self
            .iterate(key, seeds, Mode::Exhaust, move |to| {
                let net = net.clone();
                async move {
                    match net.find_value(&to, key).await? {
                        ValueOutcome::Hit { value, ttl, .. } => Ok(QueryStep::Hit((value, ttl))),
                        ValueOutcome::Nodes { token, nodes } => {
                            Ok(QueryStep::Nodes(nodes, Some(token)))
                        }
                    }
                }
            })
            .await;
        out.hit
    }

    /// Retrieve a name record at `min_generation` or newer. Replies that fail
    /// ownership verification are ignored rather than trusted.
    pub async fn find_name(
        &self,
        name: NodeId,
        min_generation: u64,
        seeds: Vec<NodeInfo>,
    ) -> Option<NameRecord> {
        let net = self.net.clone();
        let out = self
            .iterate(name, seeds, Mode::Exhaust, move |to| {
                let net = net.clone();
                async move {
                    match net.find_name(&to, name, min_generation).await? {
                        NameOutcome::Hit { record } => {
                            if verify_record_ownership(&name, &record) {
                                Ok(QueryStep::Hit(record))
                            } else {
                                trace!(name = %hex_prefix(&name), "discarding forged name record");
                                Ok(QueryStep::Nodes(Vec::new(), None))
                            }
                        }
                        NameOutcome::Nodes { nodes } => Ok(QueryStep::Nodes(nodes, None)),
                    }
                }
            })
            .await;
        out.hit
    }

    /// Collect peers announced under an info hash.
    pub async fn get_peers(&self, info_hash: NodeId, seeds: Vec<NodeInfo>) -> Vec<PeerEntry> {
        let net = self.net.clone();
        let out = self
            .iterate(info_hash, seeds, Mode::Exhaust, move |to| {
                let net = net.clone();
                async move {
                    match net.get_peers(&to, info_hash).await? {
                        PeersOutcome::Hit { peers, .. } => Ok(QueryStep::Hit(peers)),
                        PeersOutcome::Nodes { token, nodes } => {
                            Ok(QueryStep::Nodes(nodes, Some(token)))
                        }
                    }
                }
            })
            .await;
        out.hit.unwrap_or_default()
    }

    /// Two-phase publish of an immutable value: converge on the key's
    /// neighbourhood collecting tokens, then fan the write out. Returns how
    /// many peers acknowledged the write.
    pub async fn store_value(
        &self,
        key: NodeId,
        value: Vec<u8>,
        ttl: u64,
        sig: Vec<u8>,
        seeds: Vec<NodeInfo>,
    ) -> usize {
        let net = self.net.clone();
        let out = self
            .iterate(key, seeds, Mode::Converge, move |to| {
                let net = net.clone();
                async move {
                    // Phase 1 runs over find_value so each responder hands us
                    // the token its store handler will demand back.
                    match net.find_value(&to, key).await? {
                        ValueOutcome::Hit { token, .. } => {
                            Ok(QueryStep::<()>::Nodes(Vec::new(), Some(token)))
                        }
                        ValueOutcome::Nodes { token, nodes } => {
                            Ok(QueryStep::Nodes(nodes, Some(token)))
                        }
                    }
                }
            })
            .await;

        let mut writes = JoinSet::new();
        for node in out.best {
            let token = out
                .tokens
                .get(&node.id.hashed())
                .cloned()
                .unwrap_or_default();
            let net = self.net.clone();
            let value = value.clone();
            let sig = sig.clone();
            let timeout = self.config.query_timeout;
            writes.spawn(async move {
                tokio::time::timeout(timeout, net.store(&node, key, value, ttl, sig, token)).await
            });
        }
        count_acks(writes).await
    }

    /// Two-phase publish of a mutable name record. Write authority is in the
    /// record's signatures, so phase 1 is a plain node iteration.
    pub async fn store_name(
        &self,
        name: NodeId,
        record: NameRecord,
        seeds: Vec<NodeInfo>,
    ) -> usize {
        let best = self.find_node(name, seeds).await;

        let mut writes = JoinSet::new();
        for node in best {
            let net = self.net.clone();
            let record = record.clone();
            let timeout = self.config.query_timeout;
            writes.spawn(async move {
                tokio::time::timeout(timeout, net.store_name(&node, name, record, Vec::new()))
                    .await
            });
        }
        count_acks(writes).await
    }

    /// Two-phase announcement under an info hash.
    pub async fn announce(
        &self,
        info_hash: NodeId,
        port: Option<u16>,
        meta: Option<Vec<u8>>,
        ttl: u64,
        seeds: Vec<NodeInfo>,
    ) -> usize {
        let net = self.net.clone();
        let out = self
            .iterate(info_hash, seeds, Mode::Converge, move |to| {
                let net = net.clone();
                async move {
                    match net.get_peers(&to, info_hash).await? {
                        PeersOutcome::Hit { token, .. } => {
                            Ok(QueryStep::<()>::Nodes(Vec::new(), Some(token)))
                        }
                        PeersOutcome::Nodes { token, nodes } => {
                            Ok(QueryStep::Nodes(nodes, Some(token)))
                        }
                    }
                }
            })
            .await;

        let mut writes = JoinSet::new();
        for node in out.best {
            let token = out
                .tokens
                .get(&node.id.hashed())
                .cloned()
                .unwrap_or_default();
            let net = self.net.clone();
            let meta = meta.clone();
            let timeout = self.config.query_timeout;
            writes.spawn(async move {
                tokio::time::timeout(
                    timeout,
                    net.announce_peer(&node, info_hash, port, meta, token, ttl),
                )
                .await
            });
        }
        count_acks(writes).await
    }
}

/// Drain a write fan-out, counting positive acknowledgements.
async fn count_acks(
    mut writes: JoinSet<Result<anyhow::Result<bool>, tokio::time::error::Elapsed>>,
) -> usize {
    let mut acked = 0;
    while let Some(joined) = writes.join_next().await {
        if let Ok(Ok(Ok(true))) = joined {
            acked += 1;
        }
    }
    acked
}

/// A name record is only as good as its owner binding: the name must be the
/// double hash of the owner key and the owner signature must verify.
pub fn verify_record_ownership(name: &NodeId, record: &NameRecord) -> bool {
    if crypto::name_from_key(&record.owner) != *name {
        return false;
    }
    let msg = name_owner_signable(name, &record.value, record.generation);
    crypto::verify(&record.owner, &msg, &record.sig_owner).is_ok()
}

fn hex_prefix(id: &NodeId) -> String {
    hex::encode(&id.as_bytes()[..8])
}
