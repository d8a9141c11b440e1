//! Integration tests for lookups across a real localhost overlay.
//!
//! Each test spins up a handful of nodes sharing one cluster secret on
//! 127.0.0.1, bootstraps them through the first node, and exercises the
//! public API end to end over actual UDP datagrams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crisscross_dht::{gen_node_id, ClusterKeys, Dht, MemoryStore, NodeId, Timers};

fn test_timers() -> Timers {
    Timers {
        query_timeout: Duration::from_secs(2),
        search_deadline: Duration::from_secs(10),
        ..Timers::default()
    }
}

async fn spawn_node(keys: &ClusterKeys) -> Dht {
    Dht::bind(
        "127.0.0.1:0".parse().unwrap(),
        None,
        keys.clone(),
        Arc::new(MemoryStore::new()),
        test_timers(),
    )
    .await
    .expect("node bind")
}

/// Spin up `count` nodes, all bootstrapped through the first.
async fn spawn_overlay(keys: &ClusterKeys, count: usize) -> Vec<Dht> {
    let mut nodes = vec![spawn_node(keys).await];
    let entry = (nodes[0].id(), nodes[0].local_addr().unwrap());
    for _ in 1..count {
        let node = spawn_node(keys).await;
        let known = node.bootstrap(&[entry]).await;
        assert!(known > 0, "bootstrap found nobody");
        nodes.push(node);
    }
    nodes
}

async fn shutdown_all(nodes: Vec<Dht>) {
    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn bootstrap_populates_routing_tables() {
    let keys = ClusterKeys::generate();
    let nodes = spawn_overlay(&keys, 5).await;

    for node in &nodes {
        let stats = node.stats().await;
        assert!(stats.peers >= 1, "node knows no peers");
    }
    // The entry node heard from everyone.
    assert_eq!(nodes[0].stats().await.peers, 4);

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn find_node_reaches_the_whole_small_overlay() {
    let keys = ClusterKeys::generate();
    let nodes = spawn_overlay(&keys, 6).await;

    let target = gen_node_id();
    let found = nodes[1].find_node(target).await;

    // Five reachable peers, k=8: the lookup should surface them all.
    assert_eq!(found.len(), 5);

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn stored_value_is_found_from_a_cold_table() {
    let keys = ClusterKeys::generate();
    let nodes = spawn_overlay(&keys, 5).await;

    let key = gen_node_id();
    let acks = nodes[2]
        .put(key, b"replicated value".to_vec(), 600)
        .await
        .expect("put");
    assert!(acks > 0, "no peer acknowledged the store");

    // A node that joins after the write has nothing local and must search.
    let late = spawn_node(&keys).await;
    let entry: (NodeId, SocketAddr) = (nodes[0].id(), nodes[0].local_addr().unwrap());
    late.bootstrap(&[entry]).await;

    let (value, _ttl) = late.get(key).await.expect("value not found");
    assert_eq!(value, b"replicated value");

    late.shutdown().await;
    shutdown_all(nodes).await;
}

#[tokio::test]
async fn missing_value_resolves_to_not_found() {
    let keys = ClusterKeys::generate();
    let nodes = spawn_overlay(&keys, 4).await;

    assert!(nodes[1].get(gen_node_id()).await.is_none());

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn announce_then_get_peers_round_trip() {
    let keys = ClusterKeys::generate();
    let nodes = spawn_overlay(&keys, 5).await;

    let info_hash = gen_node_id();
    let acks = nodes[3].announce(info_hash, Some(6881), None, 600).await;
    assert!(acks > 0, "no peer accepted the announcement");

    let peers = nodes[1].get_peers(info_hash).await;
    assert!(!peers.is_empty(), "announcement not visible");
    assert!(peers.iter().any(|p| p.addr.port() == 6881));

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn clusters_with_different_secrets_are_mutually_deaf() {
    let keys_a = ClusterKeys::generate();
    let keys_b = ClusterKeys::generate();

    let a = spawn_node(&keys_a).await;
    let b = spawn_node(&keys_b).await;

    // B's datagrams fail to open on A's side and vice versa: bootstrap sees
    // nothing, and the routing tables stay empty.
    let known = a
        .bootstrap(&[(b.id(), b.local_addr().unwrap())])
        .await;
    assert_eq!(known, 0);
    assert_eq!(b.stats().await.peers, 0);

    a.shutdown().await;
    b.shutdown().await;
}
