//! # Wire Protocol Messages
//!
//! Every datagram body in a CrissCross overlay is one [`Packet`]: a query, a
//! response, or an error, each tagged with a transaction id. Packets are
//! serialized with bincode (fixint encoding, bounded size). The format is
//! frozen; both sides must agree bit-for-bit.
//!
//! | Query | Response on hit | Response otherwise |
//! |-------|-----------------|--------------------|
//! | `Ping` | `Ping` | (none) |
//! | `FindNode` | `FindNode` (compact nodes) | (none) |
//! | `FindValue` | `FindValue` (value + token) | `FindValueNodes` |
//! | `FindName` | `FindName` (full record) | `FindNameNodes` |
//! | `GetPeers` | `GetPeers` (peer list + token) | `GetPeersNodes` |
//! | `Store` / `StoreName` / `AnnouncePeer` | `wrote` flag | (none) |
//!
//! ## Compact node lists
//!
//! Node lists travel as packed bytes, one entry per node:
//! IPv4 = `id(32) ‖ ip(4) ‖ port(2)`, IPv6 = `id(32) ‖ ip(16) ‖ port(2)`.
//! A query's `want` selects which family the reply populates.
//!
//! ## Size limits
//!
//! All deserialization goes through [`decode`], which enforces
//! [`MAX_PACKET_SIZE`]. Oversized or malformed input is an error, never a
//! panic.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::{NodeId, ID_LEN};

/// Maximum size of a stored value (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum decoded packet size: a value plus framing headroom.
pub const MAX_PACKET_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Error code for a semantically rejected request (bad signature, stale
/// generation, failed write).
pub const ERR_SERVER: u16 = 202;

/// Error code for a malformed or unauthorized request (missing token,
/// unknown method).
pub const ERR_PROTOCOL: u16 = 203;

/// Bytes of an IPv4 compact entry.
const COMPACT_V4_LEN: usize = ID_LEN + 4 + 2;

/// Bytes of an IPv6 compact entry.
const COMPACT_V6_LEN: usize = ID_LEN + 16 + 2;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE)
        .with_fixint_encoding()
}

/// Codec failures. All of them are drop-silent at the datagram boundary.
#[derive(Debug)]
pub enum WireError {
    Encode(bincode::Error),
    Decode(bincode::Error),
    /// A compact node list is not a whole number of entries.
    CompactLength,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Encode(e) => write!(f, "encode failed: {e}"),
            WireError::Decode(e) => write!(f, "decode failed: {e}"),
            WireError::CompactLength => write!(f, "compact node list has partial entry"),
        }
    }
}

impl std::error::Error for WireError {}

/// Transaction id: the big-endian rendering of a monotonic counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tid(pub [u8; 8]);

impl Tid {
    pub fn from_counter(v: u64) -> Self {
        Self(v.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl std::fmt::Debug for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tid({})", self.as_u64())
    }
}

/// Hands out transaction ids unique within one dispatcher.
///
/// Seeded from the wall clock so ids from a restarted process do not collide
/// with responses still in flight to the old one.
pub struct TidSource {
    counter: AtomicU64,
}

impl TidSource {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1);
        Self {
            counter: AtomicU64::new(seed),
        }
    }

    pub fn next(&self) -> Tid {
        Tid::from_counter(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TidSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Which address family a node-list reply should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Want {
    N4,
    N6,
}

impl Want {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Want::N4 => addr.is_ipv4(),
            Want::N6 => addr.is_ipv6(),
        }
    }
}

/// A peer as it appears in node lists: announced (raw) id plus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Pack nodes of the wanted family into compact form.
pub fn encode_compact_nodes(nodes: &[NodeInfo], want: Want) -> Vec<u8> {
    let mut out = Vec::new();
    for node in nodes.iter().filter(|n| want.matches(&n.addr)) {
        out.extend_from_slice(node.id.as_bytes());
        match node.addr.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&node.addr.port().to_be_bytes());
    }
    out
}

/// Unpack a compact node list of the given family.
pub fn decode_compact_nodes(bytes: &[u8], want: Want) -> Result<Vec<NodeInfo>, WireError> {
    let entry_len = match want {
        Want::N4 => COMPACT_V4_LEN,
        Want::N6 => COMPACT_V6_LEN,
    };
    if bytes.len() % entry_len != 0 {
        return Err(WireError::CompactLength);
    }

    let mut nodes = Vec::with_capacity(bytes.len() / entry_len);
    for entry in bytes.chunks_exact(entry_len) {
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&entry[..ID_LEN]);
        let port = u16::from_be_bytes([entry[entry_len - 2], entry[entry_len - 1]]);
        let ip: IpAddr = match want {
            Want::N4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&entry[ID_LEN..ID_LEN + 4]);
                IpAddr::from(octets)
            }
            Want::N6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&entry[ID_LEN..ID_LEN + 16]);
                IpAddr::from(octets)
            }
        };
        nodes.push(NodeInfo {
            id: NodeId::from_bytes(id),
            addr: SocketAddr::new(ip, port),
        });
    }
    Ok(nodes)
}

/// A mutable name record as it travels the wire and sits in storage.
///
/// `owner` is the serialized public key whose double-hash is the record's
/// name. `sig_owner` covers `combine(name, value, generation)` under that
/// key; `sig_cluster` covers `combine(name, value, generation, ttl)` under
/// the cluster write key, empty when the cluster is not write-gated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    pub value: Vec<u8>,
    pub generation: u64,
    pub ttl: u64,
    pub owner: Vec<u8>,
    pub sig_cluster: Vec<u8>,
    pub sig_owner: Vec<u8>,
}

/// An entry in a `GetPeers` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub meta: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
        want: Want,
    },
    FindValue {
        id: NodeId,
        key: NodeId,
    },
    FindName {
        id: NodeId,
        name: NodeId,
        generation: u64,
    },
    GetPeers {
        id: NodeId,
        info_hash: NodeId,
        scrape: bool,
        noseed: bool,
        want: Want,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: NodeId,
        port: Option<u16>,
        meta: Option<Vec<u8>>,
        token: Vec<u8>,
        ttl: u64,
    },
    Store {
        id: NodeId,
        key: NodeId,
        value: Vec<u8>,
        ttl: u64,
        sig: Vec<u8>,
        token: Vec<u8>,
    },
    StoreName {
        id: NodeId,
        name: NodeId,
        record: NameRecord,
        token: Vec<u8>,
    },
}

impl Query {
    /// The announced (raw) id of the sender.
    pub fn sender_id(&self) -> NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::FindValue { id, .. }
            | Query::FindName { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::Store { id, .. }
            | Query::StoreName { id, .. } => *id,
        }
    }

    /// Name of the method, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::FindValue { .. } => "find_value",
            Query::FindName { .. } => "find_name",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::Store { .. } => "store",
            Query::StoreName { .. } => "store_name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<u8>,
        nodes6: Vec<u8>,
    },
    FindValue {
        id: NodeId,
        token: Vec<u8>,
        value: Vec<u8>,
        ttl: u64,
    },
    FindValueNodes {
        id: NodeId,
        token: Vec<u8>,
        nodes: Vec<u8>,
        nodes6: Vec<u8>,
    },
    FindName {
        id: NodeId,
        name: NodeId,
        record: NameRecord,
    },
    FindNameNodes {
        id: NodeId,
        nodes: Vec<u8>,
        nodes6: Vec<u8>,
    },
    GetPeers {
        id: NodeId,
        token: Vec<u8>,
        peers: Vec<PeerEntry>,
    },
    GetPeersNodes {
        id: NodeId,
        token: Vec<u8>,
        nodes: Vec<u8>,
        nodes6: Vec<u8>,
    },
    Store {
        id: NodeId,
        wrote: bool,
    },
    StoreName {
        id: NodeId,
        wrote: bool,
    },
    AnnouncePeer {
        id: NodeId,
        wrote: bool,
    },
}

impl Response {
    /// The announced (raw) id of the responder.
    pub fn sender_id(&self) -> NodeId {
        match self {
            Response::Ping { id }
            | Response::FindNode { id, .. }
            | Response::FindValue { id, .. }
            | Response::FindValueNodes { id, .. }
            | Response::FindName { id, .. }
            | Response::FindNameNodes { id, .. }
            | Response::GetPeers { id, .. }
            | Response::GetPeersNodes { id, .. }
            | Response::Store { id, .. }
            | Response::StoreName { id, .. }
            | Response::AnnouncePeer { id, .. } => *id,
        }
    }

    /// The compact node lists carried by this response, if any.
    pub fn node_lists(&self) -> Option<(&[u8], &[u8])> {
        match self {
            Response::FindNode { nodes, nodes6, .. }
            | Response::FindValueNodes { nodes, nodes6, .. }
            | Response::FindNameNodes { nodes, nodes6, .. }
            | Response::GetPeersNodes { nodes, nodes6, .. } => Some((nodes, nodes6)),
            _ => None,
        }
    }

    /// The write token carried by this response, if any.
    pub fn token(&self) -> Option<&[u8]> {
        match self {
            Response::FindValue { token, .. }
            | Response::FindValueNodes { token, .. }
            | Response::GetPeers { token, .. }
            | Response::GetPeersNodes { token, .. } => Some(token),
            _ => None,
        }
    }
}

/// One datagram body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Query {
        t: Tid,
        q: Query,
    },
    Response {
        t: Tid,
        r: Response,
    },
    Error {
        t: Tid,
        code: u16,
        message: String,
    },
}

impl Packet {
    pub fn tid(&self) -> Tid {
        match self {
            Packet::Query { t, .. } | Packet::Response { t, .. } | Packet::Error { t, .. } => *t,
        }
    }
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, WireError> {
    bincode_options().serialize(packet).map_err(WireError::Encode)
}

/// Serialize a name record for the storage boundary, so the whole record
/// (signatures included) round-trips through `put_name`/`get_name`.
pub fn encode_name_record(record: &NameRecord) -> Result<Vec<u8>, WireError> {
    bincode_options().serialize(record).map_err(WireError::Encode)
}

pub fn decode_name_record(bytes: &[u8]) -> Result<NameRecord, WireError> {
    bincode_options().deserialize(bytes).map_err(WireError::Decode)
}

pub fn decode(bytes: &[u8]) -> Result<Packet, WireError> {
    bincode_options().deserialize(bytes).map_err(WireError::Decode)
}

/// Render an endpoint for logs and peer lists: `ip:port` for IPv4,
/// `[HHHH:...:HHHH]:port` for IPv6 with all eight groups expanded.
pub fn format_endpoint(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => format!("{}:{}", ip, addr.port()),
        IpAddr::V6(ip) => {
            let segments = ip.segments();
            let groups: Vec<String> = segments.iter().map(|s| format!("{s:04X}")).collect();
            format!("[{}]:{}", groups.join(":"), addr.port())
        }
    }
}
