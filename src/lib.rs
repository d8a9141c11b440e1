//! # CrissCross DHT
//!
//! A Kademlia-style distributed hash table for multi-cluster overlays. Each
//! cluster is an independent swarm: datagrams are framed with a cluster
//! header and sealed under a cluster-wide AES-256-GCM secret, and mutable
//! records are owned by Schnorr keys with monotone generations deciding
//! updates.
//!
//! ## What a node can do
//!
//! - locate the k peers closest to any 256-bit key (`find_node`)
//! - publish and retrieve immutable values (`put` / `get`)
//! - publish and retrieve signed mutable name records (`put_name` /
//!   `get_name`), last-writer-wins by generation
//! - announce under and enumerate info hashes (`announce` / `get_peers`)
//!
//! ## Architecture
//!
//! The **Actor Pattern** keeps shared state single-owner: the routing table
//! lives in its own task behind a channel handle, the dispatcher owns the
//! cluster socket and correlates responses to searches by transaction id,
//! and each search runs as an independent task over the dispatcher.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `identity` | 32-byte ids, XOR metric, bucket arithmetic, Base58 |
//! | `crypto` | AEAD sealing, record signatures, tokens, canonical messages |
//! | `envelope` | Cluster framing around every datagram |
//! | `messages` | Wire codec: queries, responses, compact node lists |
//! | `protocols` | The `ClusterRpc` trait searches and maintenance run on |
//! | `routing` | Buckets, liveness review, the routing-table actor |
//! | `search` | Iterative lookup engine for all seven query kinds |
//! | `server` | Per-cluster UDP dispatcher |
//! | `storage` | Record-store boundary plus the in-memory implementation |
//! | `config` | Typed configuration and timer defaults |

mod config;
mod crypto;
mod envelope;
mod identity;
mod messages;
mod node;
mod protocols;
mod routing;
mod search;
mod server;
mod storage;

pub use config::{BootstrapEntry, ClusterKeys, ClusterKeysFile, ConfigFile, Timers};
pub use crypto::name_from_key;
pub use envelope::ClusterId;
pub use identity::{gen_node_id, NodeId};
pub use messages::{format_endpoint, NameRecord, NodeInfo, PeerEntry};
pub use node::{Dht, DhtStats};
pub use storage::{MemoryStore, RecordStore};

// Name records are owned by Ed25519 keys; re-exported so callers can mint
// owners without importing the crate themselves.
pub use ed25519_dalek::SigningKey;
