//! Connection registry
//!
//! Owns the pool of inter-node connections keyed by remote node id, performs
//! the NODE-ID identity exchange on new sockets, and routes outgoing messages
//! (messages addressed to the self node loop back to the local dispatcher).

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::node::{Member, NodeId, NodeStatus};
use crate::cluster::store::ClusterStore;
use crate::common::{Error, Result};
use crate::connection::transport::{Connection, MessageHandler};
use crate::protocol::{Query, QueryBody};

pub struct ConnectionRegistry {
    cluster: Arc<ClusterStore>,
    connections: DashMap<NodeId, Vec<Arc<Connection>>>,
    advertise_addr: OnceCell<String>,
    handler: OnceCell<Weak<dyn MessageHandler>>,
    loopback: mpsc::UnboundedSender<Query>,
    handshake_timeout: Duration,
    next_id: AtomicU64,
    next_pick: AtomicUsize,
}

impl ConnectionRegistry {
    /// Build the registry. The returned receiver yields messages the node
    /// sends to itself; the owner must feed them to the dispatcher.
    pub fn new(
        cluster: Arc<ClusterStore>,
        handshake_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Query>) {
        let (loopback, loopback_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            cluster,
            connections: DashMap::new(),
            advertise_addr: OnceCell::new(),
            handler: OnceCell::new(),
            loopback,
            handshake_timeout,
            next_id: AtomicU64::new(1),
            next_pick: AtomicUsize::new(0),
        });
        (registry, loopback_rx)
    }

    /// Install the handler every receive loop forwards to. Set once at startup.
    pub fn bind_handler(&self, handler: Weak<dyn MessageHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("Message handler already bound, ignoring");
        }
    }

    /// Address peers should dial to reach this node.
    pub fn set_advertise_addr(&self, addr: impl Into<String>) {
        let addr = addr.into();
        self.cluster.record_address(self.cluster.self_id(), &addr);
        let _ = self.advertise_addr.set(addr);
    }

    pub fn self_member(&self) -> Member {
        Member {
            node_id: self.cluster.self_id().clone(),
            address: self.advertise_addr.get().cloned(),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        self.cluster.self_id()
    }

    // === Handshake ===

    /// Identify the peer on a freshly accepted socket and register the
    /// connection. Does not touch cluster membership.
    pub async fn accept_inbound(self: &Arc<Self>, stream: TcpStream) -> Result<NodeId> {
        let peer_addr = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut writer = BufWriter::new(write);

        let exchange = async {
            let member = read_identity(&mut reader).await?;
            write_identity(&mut writer, &self.self_member()).await?;
            Ok::<Member, Error>(member)
        };

        let member = match self.bounded_handshake(exchange).await {
            Ok(member) => member,
            Err(e) => {
                warn!(
                    "Error exchanging connection header with {:?}, closing: {}",
                    peer_addr, e
                );
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        if let Some(addr) = &member.address {
            self.cluster.record_address(&member.node_id, addr);
        }
        self.register(member.node_id.clone(), reader, writer)?;
        info!("Accepted connection from {}", member.node_id);
        Ok(member.node_id)
    }

    /// Dial `addr`, identify both ends and register the connection.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<NodeId> {
        let stream = tokio::time::timeout(self.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionFailed(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut writer = BufWriter::new(write);

        let exchange = async {
            write_identity(&mut writer, &self.self_member()).await?;
            read_identity(&mut reader).await
        };

        let member = match self.bounded_handshake(exchange).await {
            Ok(member) => member,
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        self.cluster.record_address(&member.node_id, addr);
        self.register(member.node_id.clone(), reader, writer)?;
        info!("Connected to {} at {}", member.node_id, addr);
        Ok(member.node_id)
    }

    async fn bounded_handshake<F>(&self, exchange: F) -> Result<Member>
    where
        F: std::future::Future<Output = Result<Member>>,
    {
        let member = tokio::time::timeout(self.handshake_timeout, exchange)
            .await
            .map_err(|_| Error::Handshake("identity exchange timed out".into()))?
            .map_err(|e| match e {
                Error::Handshake(_) => e,
                other => Error::Handshake(other.to_string()),
            })?;

        if member.node_id.as_str().is_empty() {
            return Err(Error::Handshake("peer sent an empty node id".into()));
        }
        if &member.node_id == self.self_id() {
            return Err(Error::Handshake("peer reported our own node id".into()));
        }
        Ok(member)
    }

    fn register(
        self: &Arc<Self>,
        remote: NodeId,
        reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    ) -> Result<Arc<Connection>> {
        let handler = self
            .handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Internal("no message handler bound".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, self.self_id().clone(), remote.clone(), writer);
        self.connections
            .entry(remote.clone())
            .or_default()
            .push(Arc::clone(&conn));

        let registry = Arc::downgrade(self);
        conn.spawn_receive_loop(reader, handler, move |closed| {
            if let Some(registry) = registry.upgrade() {
                registry.connection_closed(closed);
            }
        });
        debug!("Registered connection {} to {}", id, remote);
        Ok(conn)
    }

    fn connection_closed(&self, conn: &Connection) {
        let remote = conn.remote_node().clone();
        let remaining = match self.connections.get_mut(&remote) {
            Some(mut pool) => {
                pool.retain(|c| c.id() != conn.id());
                pool.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.connections.remove_if(&remote, |_, pool| pool.is_empty());
            if self.cluster.has_node(&remote) {
                self.cluster.set_node_status(&remote, NodeStatus::Down);
                warn!("Lost all connections to cluster node {}", remote);
            }
        }
        debug!("Connection {} to {} closed ({} remaining)", conn.id(), remote, remaining);
    }

    // === Queries ===

    pub fn is_connected(&self, node: &NodeId) -> bool {
        node == self.self_id() || self.connection_count(node) > 0
    }

    pub fn connection_count(&self, node: &NodeId) -> usize {
        self.connections
            .get(node)
            .map(|pool| pool.iter().filter(|c| c.is_connected()).count())
            .unwrap_or(0)
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.connections
            .iter()
            .filter(|e| e.value().iter().any(|c| c.is_connected()))
            .map(|e| e.key().clone())
            .collect()
    }

    fn live_connections(&self, node: &NodeId) -> Vec<Arc<Connection>> {
        self.connections
            .get(node)
            .map(|pool| pool.iter().filter(|c| c.is_connected()).cloned().collect())
            .unwrap_or_default()
    }

    // === Sending ===

    /// Send one message to `node` over any live pooled connection.
    pub async fn send(&self, node: &NodeId, query: Query) -> Result<()> {
        if node == self.self_id() {
            return self
                .loopback
                .send(query)
                .map_err(|_| Error::NotConnected(node.to_string()));
        }

        let pool = self.live_connections(node);
        if pool.is_empty() {
            return Err(Error::NotConnected(node.to_string()));
        }

        let start = self.next_pick.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for i in 0..pool.len() {
            let conn = &pool[(start + i) % pool.len()];
            match conn.send(&query).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Send to {} over connection {} failed: {}", node, conn.id(), e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::NotConnected(node.to_string())))
    }

    /// Send to each node, reporting per-node failures instead of stopping.
    pub async fn broadcast(&self, nodes: &[NodeId], query: &Query) -> Vec<(NodeId, Error)> {
        let sends = nodes.iter().map(|node| {
            let query = query.clone();
            async move { (node.clone(), self.send(node, query).await) }
        });
        futures_util::future::join_all(sends)
            .await
            .into_iter()
            .filter_map(|(node, res)| res.err().map(|e| (node, e)))
            .collect()
    }

    // === Teardown ===

    /// Close every connection to `node`.
    pub async fn disconnect_node(&self, node: &NodeId) {
        if let Some((_, pool)) = self.connections.remove(node) {
            for conn in pool {
                conn.terminate().await;
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let nodes: Vec<NodeId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for node in nodes {
            self.disconnect_node(&node).await;
        }
    }
}

async fn read_identity(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Result<Member> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::Handshake("peer closed before identifying".into()));
    }
    match Query::decode(line.trim())?.body {
        QueryBody::NodeId(member) => Ok(member),
        other => Err(Error::Handshake(format!(
            "expected NODE-ID, got {}",
            other.query_type()
        ))),
    }
}

async fn write_identity(
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    member: &Member,
) -> Result<()> {
    let line = Query::bare(QueryBody::NodeId(member.clone())).encode()?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
