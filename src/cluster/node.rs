//! Node identity and liveness status

use serde::{Deserialize, Serialize};

/// Stable node identity (a UUID string once assigned).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Node status as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Unknown,
    NewNode,
    ReadyToConnect,
    Syncing,
    Connected,
    Down,
}

impl NodeStatus {
    /// Can this node take part in clustered queries?
    pub fn is_connected(&self) -> bool {
        matches!(self, NodeStatus::Connected)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "unknown"),
            NodeStatus::NewNode => write!(f, "new_node"),
            NodeStatus::ReadyToConnect => write!(f, "ready_to_connect"),
            NodeStatus::Syncing => write!(f, "syncing"),
            NodeStatus::Connected => write!(f, "connected"),
            NodeStatus::Down => write!(f, "down"),
        }
    }
}

/// A cluster member and the address its cluster listener is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Row of a LIST-NODES answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub is_self: bool,
}
