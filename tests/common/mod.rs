//! Shared helpers for in-process cluster tests

#![allow(dead_code)]

use nodemesh::cluster::{Member, NodeId};
use nodemesh::protocol::{Query, QueryBody};
use nodemesh::{ClusterNode, Collaborators, NodeConfig};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub fn test_config() -> NodeConfig {
    NodeConfig {
        cluster_addr: "127.0.0.1:0".parse().unwrap(),
        handshake_timeout_ms: 2_000,
        phase_timeout_ms: 5_000,
        commit_timeout_ms: 5_000,
        worker_threads: 4,
        ..Default::default()
    }
}

pub async fn start_node() -> ClusterNode {
    start_node_with(test_config(), Collaborators::default()).await
}

pub async fn start_node_with(config: NodeConfig, collaborators: Collaborators) -> ClusterNode {
    ClusterNode::start(config, collaborators).await.unwrap()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Await `fut` with a generous ceiling so a hung test fails instead of blocking.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(20), fut)
        .await
        .expect("operation timed out")
}

/// A raw peer speaking the line protocol by hand.
pub struct FakePeer {
    pub id: NodeId,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakePeer {
    /// Connect and complete the NODE-ID exchange.
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs, id: &str) -> (FakePeer, Member) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        let mut peer = FakePeer {
            id: NodeId::new(id),
            reader: BufReader::new(read),
            writer,
        };
        peer.send(&Query::bare(QueryBody::NodeId(Member {
            node_id: NodeId::new(id),
            address: None,
        })))
        .await;
        let reply = peer.recv().await.expect("no identity reply");
        match reply.body {
            QueryBody::NodeId(member) => (peer, member),
            other => panic!("expected NODE-ID, got {:?}", other),
        }
    }

    pub async fn send(&mut self, query: &Query) {
        self.send_line(&query.encode().unwrap()).await;
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next message, or `None` if nothing arrives within two seconds.
    pub async fn recv(&mut self) -> Option<Query> {
        self.recv_within(Duration::from_secs(2)).await
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Option<Query> {
        let mut line = String::new();
        match tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(Query::decode(line.trim()).unwrap()),
            _ => None,
        }
    }
}
