//! # Cluster Dispatcher
//!
//! One UDP socket per cluster. The dispatcher owns both directions of the
//! wire:
//!
//! - **Outbound**: implements [`ClusterRpc`] for searches and routing
//!   maintenance: seal the query, send it, park a oneshot in the pending
//!   map under a fresh transaction id, resolve it when the response lands
//!   (or time out).
//! - **Inbound**: the receive loop unframes and unseals each datagram.
//!   Queries are answered from the routing table and record storage;
//!   responses are correlated by transaction id and handed to the waiting
//!   caller; wire errors resolve the caller with a failure.
//!
//! Anything that does not parse, does not authenticate, or references an
//! unknown transaction is dropped without a reply. Requests that parse but
//! are rejected (bad signature, missing token) get an error packet back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::{ClusterKeys, Timers};
use crate::crypto::{self, TokenMinter};
use crate::envelope;
use crate::identity::NodeId;
use crate::messages::{
    self, decode_compact_nodes, encode_compact_nodes, NameRecord, NodeInfo, Packet, Query,
    Response, Tid, TidSource, Want, ERR_PROTOCOL, ERR_SERVER, MAX_VALUE_SIZE,
};
use crate::protocols::{ClusterRpc, NameOutcome, PeersOutcome, ValueOutcome};
use crate::routing::Routing;
use crate::search::verify_record_ownership;
use crate::storage::RecordStore;

/// Receive buffer: max UDP payload.
const RECV_BUF: usize = 64 * 1024;

/// A peer error resolved out of the pending map: numeric code plus text.
type PeerError = (u16, String);
type PendingMap = HashMap<u64, oneshot::Sender<Result<Response, PeerError>>>;

struct ServerInner {
    socket: UdpSocket,
    self_raw: NodeId,
    keys: ClusterKeys,
    store: Arc<dyn RecordStore>,
    timers: Timers,
    tids: TidSource,
    pending: Mutex<PendingMap>,
    tokens: Mutex<TokenMinter>,
    routing: OnceLock<Routing>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to one cluster's dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct ClusterServer {
    inner: Arc<ServerInner>,
}

impl ClusterServer {
    /// Bind the cluster socket. Call [`attach_routing`](Self::attach_routing)
    /// and [`start`](Self::start) before expecting traffic.
    pub async fn bind(
        bind: SocketAddr,
        self_raw: NodeId,
        keys: ClusterKeys,
        store: Arc<dyn RecordStore>,
        timers: Timers,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("binding cluster socket on {bind}"))?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                socket,
                self_raw,
                keys,
                store,
                timers,
                tids: TidSource::new(),
                pending: Mutex::new(HashMap::new()),
                tokens: Mutex::new(TokenMinter::new()),
                routing: OnceLock::new(),
                recv_task: Mutex::new(None),
            }),
        })
    }

    /// Wire in the routing-table handle. Must happen exactly once.
    pub fn attach_routing(&self, routing: Routing) {
        if self.inner.routing.set(routing).is_err() {
            warn!("routing handle attached twice; keeping the first");
        }
    }

    /// Spawn the receive loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUF];
            loop {
                let (len, from) = match inner.socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "cluster socket closed");
                        break;
                    }
                };
                process_datagram(&inner, &buf[..len], from).await;
            }
        });
        *self.inner.recv_task.lock().unwrap() = Some(task);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.socket.local_addr().context("local_addr")
    }

    pub fn cluster_id(&self) -> crate::envelope::ClusterId {
        self.inner.keys.id
    }

    /// Stop the receive loop and drop every in-flight query.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.recv_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.pending.lock().unwrap().clear();
    }

    fn routing(&self) -> Option<&Routing> {
        self.inner.routing.get()
    }

    async fn send_packet(&self, to: SocketAddr, packet: &Packet) -> Result<()> {
        let body = messages::encode(packet)?;
        let datagram = envelope::frame(&self.inner.keys.id, &self.inner.keys.secret, &body)?;
        self.inner
            .socket
            .send_to(&datagram, to)
            .await
            .with_context(|| format!("sending to {to}"))?;
        Ok(())
    }

    /// Send one query and wait for its response, error packet, or timeout.
    async fn request(&self, to: SocketAddr, query: Query) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let tid = {
            let mut pending = self.inner.pending.lock().unwrap();
            // Regenerate on the (clock-step) case of a tid still in flight.
            let tid = loop {
                let tid = self.inner.tids.next();
                if !pending.contains_key(&tid.as_u64()) {
                    break tid;
                }
            };
            pending.insert(tid.as_u64(), tx);
            tid
        };

        let packet = Packet::Query { t: tid, q: query };
        if let Err(e) = self.send_packet(to, &packet).await {
            self.inner.pending.lock().unwrap().remove(&tid.as_u64());
            return Err(e);
        }

        match tokio::time::timeout(self.inner.timers.query_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err((code, message)))) => Err(anyhow!("peer error {code}: {message}")),
            Ok(Err(_)) => Err(anyhow!("dispatcher shut down")),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&tid.as_u64());
                Err(anyhow!("query to {to} timed out"))
            }
        }
    }

    fn want_for(addr: &SocketAddr) -> Want {
        if addr.is_ipv6() {
            Want::N6
        } else {
            Want::N4
        }
    }
}

fn merge_node_lists(nodes: &[u8], nodes6: &[u8]) -> Result<Vec<NodeInfo>> {
    let mut merged = decode_compact_nodes(nodes, Want::N4)?;
    merged.extend(decode_compact_nodes(nodes6, Want::N6)?);
    Ok(merged)
}

#[async_trait]
impl ClusterRpc for ClusterServer {
    async fn ping(&self, to: SocketAddr) -> Result<NodeId> {
        let query = Query::Ping {
            id: self.inner.self_raw,
        };
        match self.request(to, query).await? {
            Response::Ping { id } => Ok(id),
            other => Err(anyhow!("unexpected reply to ping: {other:?}")),
        }
    }

    async fn find_node(&self, to: &NodeInfo, target: NodeId) -> Result<Vec<NodeInfo>> {
        let query = Query::FindNode {
            id: self.inner.self_raw,
            target,
            want: Self::want_for(&to.addr),
        };
        match self.request(to.addr, query).await? {
            Response::FindNode { nodes, nodes6, .. } => merge_node_lists(&nodes, &nodes6),
            other => Err(anyhow!("unexpected reply to find_node: {other:?}")),
        }
    }

    async fn find_value(&self, to: &NodeInfo, key: NodeId) -> Result<ValueOutcome> {
        let query = Query::FindValue {
            id: self.inner.self_raw,
            key,
        };
        match self.request(to.addr, query).await? {
            Response::FindValue {
                token, value, ttl, ..
            } => Ok(ValueOutcome::Hit { value, ttl, token }),
            Response::FindValueNodes {
                token,
                nodes,
                nodes6,
                ..
            } => Ok(ValueOutcome::Nodes {
                token,
                nodes: merge_node_lists(&nodes, &nodes6)?,
            }),
            other => Err(anyhow!("unexpected reply to find_value: {other:?}")),
        }
    }

    async fn find_name(
        &self,
        to: &NodeInfo,
        name: NodeId,
        generation: u64,
    ) -> Result<NameOutcome> {
        let query = Query::FindName {
            id: self.inner.self_raw,
            name,
            generation,
        };
        match self.request(to.addr, query).await? {
            Response::FindName { record, .. } => Ok(NameOutcome::Hit { record }),
            Response::FindNameNodes { nodes, nodes6, .. } => Ok(NameOutcome::Nodes {
                nodes: merge_node_lists(&nodes, &nodes6)?,
            }),
            other => Err(anyhow!("unexpected reply to find_name: {other:?}")),
        }
    }

    async fn get_peers(&self, to: &NodeInfo, info_hash: NodeId) -> Result<PeersOutcome> {
        let query = Query::GetPeers {
            id: self.inner.self_raw,
            info_hash,
            scrape: false,
            noseed: false,
            want: Self::want_for(&to.addr),
        };
        match self.request(to.addr, query).await? {
            Response::GetPeers { token, peers, .. } => Ok(PeersOutcome::Hit { peers, token }),
            Response::GetPeersNodes {
                token,
                nodes,
                nodes6,
                ..
            } => Ok(PeersOutcome::Nodes {
                token,
                nodes: merge_node_lists(&nodes, &nodes6)?,
            }),
            other => Err(anyhow!("unexpected reply to get_peers: {other:?}")),
        }
    }

    async fn store(
        &self,
        to: &NodeInfo,
        key: NodeId,
        value: Vec<u8>,
        ttl: u64,
        sig: Vec<u8>,
        token: Vec<u8>,
    ) -> Result<bool> {
        let query = Query::Store {
            id: self.inner.self_raw,
            key,
            value,
            ttl,
            sig,
            token,
        };
        match self.request(to.addr, query).await? {
            Response::Store { wrote, .. } => Ok(wrote),
            other => Err(anyhow!("unexpected reply to store: {other:?}")),
        }
    }

    async fn store_name(
        &self,
        to: &NodeInfo,
        name: NodeId,
        record: NameRecord,
        token: Vec<u8>,
    ) -> Result<bool> {
        let query = Query::StoreName {
            id: self.inner.self_raw,
            name,
            record,
            token,
        };
        match self.request(to.addr, query).await? {
            Response::StoreName { wrote, .. } => Ok(wrote),
            other => Err(anyhow!("unexpected reply to store_name: {other:?}")),
        }
    }

    async fn announce_peer(
        &self,
        to: &NodeInfo,
        info_hash: NodeId,
        port: Option<u16>,
        meta: Option<Vec<u8>>,
        token: Vec<u8>,
        ttl: u64,
    ) -> Result<bool> {
        let query = Query::AnnouncePeer {
            id: self.inner.self_raw,
            info_hash,
            port,
            meta,
            token,
            ttl,
        };
        match self.request(to.addr, query).await? {
            Response::AnnouncePeer { wrote, .. } => Ok(wrote),
            other => Err(anyhow!("unexpected reply to announce_peer: {other:?}")),
        }
    }
}

/// Unframe, unseal, decode, dispatch. Every early return is a silent drop.
async fn process_datagram(inner: &Arc<ServerInner>, bytes: &[u8], from: SocketAddr) {
    let frame = match envelope::parse(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            trace!(%from, error = %e, "dropping datagram");
            return;
        }
    };
    if frame.cluster != inner.keys.id {
        trace!(%from, "dropping datagram for unknown cluster");
        return;
    }
    let body = match envelope::unseal(&frame, &inner.keys.secret) {
        Ok(body) => body,
        Err(_) => {
            trace!(%from, "dropping datagram that failed to open");
            return;
        }
    };
    let packet = match messages::decode(&body) {
        Ok(packet) => packet,
        Err(e) => {
            trace!(%from, error = %e, "dropping undecodable packet");
            return;
        }
    };

    match packet {
        Packet::Query { t, q } => {
            if let Some(routing) = inner.routing.get() {
                routing.insert(q.sender_id(), from).await;
            }
            let method = q.method();
            let reply = match handle_query(inner, q, from).await {
                Ok(response) => Packet::Response { t, r: response },
                Err((code, message)) => {
                    debug!(%from, method, code, %message, "rejecting query");
                    Packet::Error { t, code, message }
                }
            };
            send_reply(inner, from, &reply).await;
        }
        Packet::Response { t, r } => {
            let waiter = inner.pending.lock().unwrap().remove(&t.as_u64());
            match waiter {
                Some(tx) => {
                    if let Some(routing) = inner.routing.get() {
                        routing.insert(r.sender_id(), from).await;
                        routing.responded(r.sender_id()).await;
                    }
                    let _ = tx.send(Ok(r));
                }
                None => trace!(%from, tid = t.as_u64(), "dropping unsolicited response"),
            }
        }
        Packet::Error { t, code, message } => {
            let waiter = inner.pending.lock().unwrap().remove(&t.as_u64());
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Err((code, message)));
                }
                None => trace!(%from, tid = t.as_u64(), "dropping unsolicited error"),
            }
        }
    }
}

async fn send_reply(inner: &Arc<ServerInner>, to: SocketAddr, packet: &Packet) {
    let Ok(body) = messages::encode(packet) else {
        return;
    };
    let Ok(datagram) = envelope::frame(&inner.keys.id, &inner.keys.secret, &body) else {
        return;
    };
    if let Err(e) = inner.socket.send_to(&datagram, to).await {
        debug!(%to, error = %e, "reply send failed");
    }
}

/// Answer one inbound query from the routing table and record storage.
async fn handle_query(
    inner: &Arc<ServerInner>,
    query: Query,
    from: SocketAddr,
) -> Result<Response, PeerError> {
    let self_id = inner.self_raw;
    let sender_hashed = query.sender_id().hashed();
    let closest = |target: NodeId| async move {
        match inner.routing.get() {
            Some(routing) => routing.closest(target, Some(sender_hashed)).await,
            None => Vec::new(),
        }
    };

    match query {
        Query::Ping { .. } => Ok(Response::Ping { id: self_id }),

        Query::FindNode { target, want, .. } => {
            let nodes = closest(target).await;
            let (n4, n6) = match want {
                Want::N4 => (encode_compact_nodes(&nodes, Want::N4), Vec::new()),
                Want::N6 => (Vec::new(), encode_compact_nodes(&nodes, Want::N6)),
            };
            Ok(Response::FindNode {
                id: self_id,
                nodes: n4,
                nodes6: n6,
            })
        }

        Query::FindValue { key, .. } => {
            let token = inner.tokens.lock().unwrap().mint(from.ip(), &key);
            match inner.store.get(&inner.keys.id, &key).await {
                Some((value, ttl)) => Ok(Response::FindValue {
                    id: self_id,
                    token,
                    value,
                    ttl,
                }),
                None => {
                    let nodes = closest(key).await;
                    Ok(Response::FindValueNodes {
                        id: self_id,
                        token,
                        nodes: encode_compact_nodes(&nodes, Want::N4),
                        nodes6: encode_compact_nodes(&nodes, Want::N6),
                    })
                }
            }
        }

        Query::FindName {
            name, generation, ..
        } => {
            if let Some((bytes, stored_gen)) = inner.store.get_name(&inner.keys.id, &name).await {
                if stored_gen >= generation {
                    match messages::decode_name_record(&bytes) {
                        Ok(record) => {
                            return Ok(Response::FindName {
                                id: self_id,
                                name,
                                record,
                            })
                        }
                        // A corrupt stored record heals by falling through to
                        // a nodes reply.
                        Err(e) => warn!(error = %e, "stored name record failed to decode"),
                    }
                }
            }
            let nodes = closest(name).await;
            Ok(Response::FindNameNodes {
                id: self_id,
                nodes: encode_compact_nodes(&nodes, Want::N4),
                nodes6: encode_compact_nodes(&nodes, Want::N6),
            })
        }

        Query::GetPeers {
            info_hash, want, ..
        } => {
            let token = inner.tokens.lock().unwrap().mint(from.ip(), &info_hash);
            let peers = inner.store.get_peers(&inner.keys.id, &info_hash).await;
            if peers.is_empty() {
                let nodes = closest(info_hash).await;
                let (n4, n6) = match want {
                    Want::N4 => (encode_compact_nodes(&nodes, Want::N4), Vec::new()),
                    Want::N6 => (Vec::new(), encode_compact_nodes(&nodes, Want::N6)),
                };
                Ok(Response::GetPeersNodes {
                    id: self_id,
                    token,
                    nodes: n4,
                    nodes6: n6,
                })
            } else {
                Ok(Response::GetPeers {
                    id: self_id,
                    token,
                    peers,
                })
            }
        }

        Query::Store {
            key,
            value,
            ttl,
            sig,
            token,
            ..
        } => {
            if !inner.tokens.lock().unwrap().validate(from.ip(), &key, &token) {
                return Err((ERR_PROTOCOL, "missing or stale token".into()));
            }
            if value.len() > MAX_VALUE_SIZE {
                return Err((ERR_PROTOCOL, "value too large".into()));
            }
            if let Some(public) = &inner.keys.public_key {
                let msg = crypto::value_signable(&key, &value, ttl);
                if crypto::verify(public, &msg, &sig).is_err() {
                    return Err((ERR_SERVER, "bad signature".into()));
                }
            }
            let wrote = inner.store.put(&inner.keys.id, &key, value, ttl).await;
            Ok(Response::Store { id: self_id, wrote })
        }

        Query::StoreName { name, record, .. } => {
            if !verify_record_ownership(&name, &record) {
                return Err((ERR_SERVER, "bad owner signature".into()));
            }
            if let Some(public) = &inner.keys.public_key {
                let msg = crypto::name_cluster_signable(
                    &name,
                    &record.value,
                    record.generation,
                    record.ttl,
                );
                if crypto::verify(public, &msg, &record.sig_cluster).is_err() {
                    return Err((ERR_SERVER, "bad cluster signature".into()));
                }
            }
            let generation = record.generation;
            let ttl = record.ttl;
            let bytes = messages::encode_name_record(&record)
                .map_err(|_| (ERR_SERVER, "record too large".to_string()))?;
            let wrote = inner
                .store
                .put_name(&inner.keys.id, &name, bytes, generation, ttl)
                .await;
            Ok(Response::StoreName { id: self_id, wrote })
        }

        Query::AnnouncePeer {
            info_hash,
            port,
            meta,
            token,
            ttl,
            ..
        } => {
            if !inner
                .tokens
                .lock()
                .unwrap()
                .validate(from.ip(), &info_hash, &token)
            {
                return Err((ERR_PROTOCOL, "missing or stale token".into()));
            }
            let addr = SocketAddr::new(from.ip(), port.unwrap_or_else(|| from.port()));
            let wrote = inner
                .store
                .announce(&inner.keys.id, &info_hash, addr, meta, ttl)
                .await;
            Ok(Response::AnnouncePeer { id: self_id, wrote })
        }
    }
}
