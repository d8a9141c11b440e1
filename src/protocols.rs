//! Protocol trait for the query surface of a cluster overlay.
//!
//! [`ClusterRpc`] abstracts the dispatcher's sealed-UDP transport behind
//! plain async request/response calls. The search engine and the routing
//! table's liveness machinery depend only on this trait, which keeps them
//! free of socket handling and lets tests drive them with scripted in-memory
//! networks.
//!
//! Each method sends one query and resolves with the decoded response, or an
//! error on timeout / wire-level failure. Timeouts are ordinary errors here;
//! callers decide whether they matter.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::NodeId;
use crate::messages::{NameRecord, NodeInfo, PeerEntry};

/// What a `find_value` query came back with.
#[derive(Debug, Clone)]
pub enum ValueOutcome {
    /// The responder had the value.
    Hit {
        value: Vec<u8>,
        ttl: u64,
        token: Vec<u8>,
    },
    /// The responder only had closer nodes.
    Nodes { token: Vec<u8>, nodes: Vec<NodeInfo> },
}

/// What a `find_name` query came back with.
#[derive(Debug, Clone)]
pub enum NameOutcome {
    /// The responder had a record at or beyond the requested generation.
    Hit { record: NameRecord },
    /// The responder only had closer nodes.
    Nodes { nodes: Vec<NodeInfo> },
}

/// What a `get_peers` query came back with.
#[derive(Debug, Clone)]
pub enum PeersOutcome {
    /// The responder knew peers for the info hash.
    Hit {
        peers: Vec<PeerEntry>,
        token: Vec<u8>,
    },
    /// The responder only had closer nodes.
    Nodes { token: Vec<u8>, nodes: Vec<NodeInfo> },
}

/// The seven queries of the overlay, as seen by searches and maintenance.
#[async_trait]
pub trait ClusterRpc: Send + Sync + 'static {
    /// Liveness probe. Resolves with the responder's announced id.
    async fn ping(&self, to: SocketAddr) -> Result<NodeId>;

    /// Ask a peer for its closest nodes to `target`.
    async fn find_node(&self, to: &NodeInfo, target: NodeId) -> Result<Vec<NodeInfo>>;

    /// Ask a peer for a stored value, or failing that its closest nodes.
    async fn find_value(&self, to: &NodeInfo, key: NodeId) -> Result<ValueOutcome>;

    /// Ask a peer for a name record at generation `generation` or newer.
    async fn find_name(&self, to: &NodeInfo, name: NodeId, generation: u64)
        -> Result<NameOutcome>;

    /// Ask a peer who else announced under an info hash.
    async fn get_peers(&self, to: &NodeInfo, info_hash: NodeId) -> Result<PeersOutcome>;

    /// Push an immutable value record. Resolves with the `wrote` flag.
    async fn store(
        &self,
        to: &NodeInfo,
        key: NodeId,
        value: Vec<u8>,
        ttl: u64,
        sig: Vec<u8>,
        token: Vec<u8>,
    ) -> Result<bool>;

    /// Push a mutable name record. Resolves with the `wrote` flag.
    async fn store_name(
        &self,
        to: &NodeInfo,
        name: NodeId,
        record: NameRecord,
        token: Vec<u8>,
    ) -> Result<bool>;

    /// Announce ourselves under an info hash. Resolves with the `wrote` flag.
    #[allow(clippy::too_many_arguments)]
    async fn announce_peer(
        &self,
        to: &NodeInfo,
        info_hash: NodeId,
        port: Option<u16>,
        meta: Option<Vec<u8>>,
        token: Vec<u8>,
        ttl: u64,
    ) -> Result<bool>;
}
