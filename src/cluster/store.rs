//! Cluster membership store
//!
//! Authoritative in-memory view of the cluster id, member node ids, per-node
//! status and the self node id, written through to a [`ConfigStore`].

use dashmap::{DashMap, DashSet};
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::config_store::{
    ConfigStore, KEY_CLUSTER_ID, KEY_CLUSTER_NODES, KEY_OPERATING_MODE, KEY_SELF_NODE_ID,
    MODE_CLUSTER,
};
use crate::cluster::node::{Member, NodeId, NodeInfo, NodeStatus};
use crate::common::{Error, ErrorCode, Result};

/// Supplies the current load of a node for replica placement.
pub trait LoadReporter: Send + Sync {
    /// Lower is less loaded. `None` when the node's load is unknown.
    fn load(&self, node: &NodeId) -> Option<u64>;
}

pub struct ClusterStore {
    self_id: NodeId,
    cluster_id: OnceCell<String>,
    members: DashSet<NodeId>,
    statuses: DashMap<NodeId, NodeStatus>,
    addresses: DashMap<NodeId, String>,
    config: Arc<dyn ConfigStore>,
    load: Option<Arc<dyn LoadReporter>>,
}

impl ClusterStore {
    /// Load persisted state. Never fails: an unreachable config store leaves
    /// the node standalone with a best-effort identity.
    pub fn open(config: Arc<dyn ConfigStore>) -> Self {
        let self_id = resolve_self_id(config.as_ref());

        let store = Self {
            self_id: self_id.clone(),
            cluster_id: OnceCell::new(),
            members: DashSet::new(),
            statuses: DashMap::new(),
            addresses: DashMap::new(),
            config,
            load: None,
        };

        match store.config.get(KEY_CLUSTER_ID) {
            Ok(Some(id)) if !id.is_empty() => {
                let _ = store.cluster_id.set(id);
            }
            Ok(_) => {}
            Err(e) => warn!("Unable to read cluster id, defaulting to standalone mode: {}", e),
        }

        match store.config.get(KEY_CLUSTER_NODES) {
            Ok(Some(json)) => match serde_json::from_str::<Vec<NodeId>>(&json) {
                Ok(nodes) => {
                    for node in nodes {
                        store.statuses.insert(node.clone(), NodeStatus::Unknown);
                        store.members.insert(node);
                    }
                }
                Err(e) => warn!("Ignoring corrupted cluster member list: {}", e),
            },
            Ok(None) => {
                if store.cluster_id.get().is_some() {
                    warn!("Cluster id is set but no member list was found");
                }
            }
            Err(e) => warn!("Unable to read cluster member list: {}", e),
        }

        store.members.insert(self_id.clone());
        let self_status = if store.cluster_id.get().is_some() {
            NodeStatus::Connected
        } else {
            NodeStatus::Unknown
        };
        store.statuses.insert(self_id.clone(), self_status);

        info!(
            "Node {} ({})",
            self_id,
            store
                .cluster_id
                .get()
                .map(|c| format!("cluster {}", c))
                .unwrap_or_else(|| "standalone".to_string())
        );
        store
    }

    pub fn with_load_reporter(mut self, load: Arc<dyn LoadReporter>) -> Self {
        self.load = Some(load);
        self
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn cluster_id(&self) -> Option<String> {
        self.cluster_id.get().cloned()
    }

    pub fn is_clustered(&self) -> bool {
        self.cluster_id.get().is_some()
    }

    // === Cluster lifecycle ===

    /// Turn this standalone node into the first node of a new cluster.
    pub fn create_cluster(&self) -> Result<String> {
        let mut created = false;
        let id = self.cluster_id.get_or_try_init(|| -> Result<String> {
            let id = uuid::Uuid::new_v4().to_string();
            self.config.put(KEY_CLUSTER_ID, &id)?;
            self.config.put(KEY_OPERATING_MODE, MODE_CLUSTER)?;
            created = true;
            Ok(id)
        })?;

        if !created {
            return Err(Error::operation(
                ErrorCode::AlreadyACluster,
                format!("node is already part of cluster {}", id),
            ));
        }

        self.persist_members()?;
        self.statuses
            .insert(self.self_id.clone(), NodeStatus::Connected);
        info!("Created cluster {}", id);
        Ok(id.clone())
    }

    /// Adopt the cluster this node was onboarded into.
    pub fn join_cluster(&self, cluster_id: &str, members: &[Member]) -> Result<()> {
        let mut joined = false;
        let current = self.cluster_id.get_or_try_init(|| -> Result<String> {
            self.config.put(KEY_CLUSTER_ID, cluster_id)?;
            self.config.put(KEY_OPERATING_MODE, MODE_CLUSTER)?;
            joined = true;
            Ok(cluster_id.to_string())
        })?;

        if !joined && current != cluster_id {
            return Err(Error::operation(
                ErrorCode::AlreadyACluster,
                format!("node already belongs to cluster {}", current),
            ));
        }

        for member in members {
            if let Some(addr) = &member.address {
                self.record_address(&member.node_id, addr);
            }
            if member.node_id != self.self_id && self.members.insert(member.node_id.clone()) {
                self.statuses
                    .insert(member.node_id.clone(), NodeStatus::Connected);
            }
        }
        self.persist_members()?;
        info!("Joined cluster {} with {} members", current, self.members.len());
        Ok(())
    }

    // === Membership ===

    /// Add a node to the member set. No-op if already present.
    pub fn notify_add_node(&self, node_id: &NodeId) {
        if self.members.insert(node_id.clone()) {
            self.statuses.insert(node_id.clone(), NodeStatus::Unknown);
            debug!("Added node {} to cluster members", node_id);
            if let Err(e) = self.persist_members() {
                warn!("Failed to persist member list after adding {}: {}", node_id, e);
            }
        }
    }

    /// Remove a node from the member set. No-op if absent.
    pub fn notify_remove_node(&self, node_id: &NodeId) {
        if node_id == &self.self_id {
            warn!("Refusing to remove self node {} from members", node_id);
            return;
        }
        if self.members.remove(node_id).is_some() {
            self.statuses.remove(node_id);
            debug!("Removed node {} from cluster members", node_id);
            if let Err(e) = self.persist_members() {
                warn!("Failed to persist member list after removing {}: {}", node_id, e);
            }
        }
    }

    pub fn has_node(&self, node_id: &NodeId) -> bool {
        self.members.contains(node_id)
    }

    /// Snapshot of all members, sorted by id.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.members.iter().map(|n| n.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// Members other than self.
    pub fn peers(&self) -> Vec<NodeId> {
        self.all_nodes()
            .into_iter()
            .filter(|n| n != &self.self_id)
            .collect()
    }

    /// Members with their known listener addresses.
    pub fn member_list(&self) -> Vec<Member> {
        self.all_nodes()
            .into_iter()
            .map(|node_id| Member {
                address: self.address(&node_id),
                node_id,
            })
            .collect()
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.all_nodes()
            .into_iter()
            .map(|node_id| NodeInfo {
                status: self.node_status(&node_id).unwrap_or(NodeStatus::Unknown),
                address: self.address(&node_id),
                is_self: node_id == self.self_id,
                node_id,
            })
            .collect()
    }

    // === Status ===

    pub fn node_status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.statuses.get(node_id).map(|s| *s)
    }

    pub fn self_status(&self) -> NodeStatus {
        self.node_status(&self.self_id).unwrap_or(NodeStatus::Unknown)
    }

    pub fn set_node_status(&self, node_id: &NodeId, status: NodeStatus) {
        let previous = self.statuses.insert(node_id.clone(), status);
        if previous != Some(status) {
            debug!("Node {} status {:?} -> {}", node_id, previous, status);
        }
    }

    /// Atomically move `node_id` from `expected` to `next`.
    pub fn transition_status(&self, node_id: &NodeId, expected: NodeStatus, next: NodeStatus) -> bool {
        match self.statuses.get_mut(node_id) {
            Some(mut status) if *status == expected => {
                *status = next;
                debug!("Node {} status {} -> {}", node_id, expected, next);
                true
            }
            _ => false,
        }
    }

    /// Set `node_id` to `next` unless it is already CONNECTED. Returns
    /// whether the status changed.
    pub fn set_status_unless_connected(&self, node_id: &NodeId, next: NodeStatus) -> bool {
        let mut status = self
            .statuses
            .entry(node_id.clone())
            .or_insert(NodeStatus::Unknown);
        if *status == NodeStatus::Connected || *status == next {
            return false;
        }
        debug!("Node {} status {} -> {}", node_id, *status, next);
        *status = next;
        true
    }

    // === Addresses ===

    pub fn record_address(&self, node_id: &NodeId, address: &str) {
        self.addresses.insert(node_id.clone(), address.to_string());
    }

    pub fn address(&self, node_id: &NodeId) -> Option<String> {
        self.addresses.get(node_id).map(|a| a.clone())
    }

    // === Placement ===

    /// Nodes that should hold a replica.
    ///
    /// `-1` means full replication and `0` keeps data on the self node. A
    /// positive factor returns up to that many members ordered by reported
    /// load, ties broken by node id.
    pub fn get_least_loaded_nodes(&self, replication_factor: i32) -> Result<HashSet<NodeId>> {
        let members = self.all_nodes();
        if replication_factor == -1 || members.len() == 1 {
            return Ok(members.into_iter().collect());
        }

        if replication_factor == 0 {
            return Ok(HashSet::from([self.self_id.clone()]));
        }

        if replication_factor < 0 {
            return Err(Error::operation(
                ErrorCode::InvalidArgument,
                format!("invalid replication factor {}", replication_factor),
            ));
        }

        let mut ranked: Vec<(u64, NodeId)> = members
            .into_iter()
            .map(|node| {
                let load = self
                    .load
                    .as_ref()
                    .and_then(|l| l.load(&node))
                    .unwrap_or(u64::MAX);
                (load, node)
            })
            .collect();
        ranked.sort();

        Ok(ranked
            .into_iter()
            .take(replication_factor as usize)
            .map(|(_, node)| node)
            .collect())
    }

    fn persist_members(&self) -> Result<()> {
        let json = serde_json::to_string(&self.all_nodes())?;
        self.config.put(KEY_CLUSTER_NODES, &json)
    }
}

fn resolve_self_id(config: &dyn ConfigStore) -> NodeId {
    match config.get(KEY_SELF_NODE_ID) {
        Ok(Some(id)) if !id.is_empty() => NodeId::new(id),
        Ok(_) => {
            let id = NodeId::random();
            if let Err(e) = config.put(KEY_SELF_NODE_ID, id.as_str()) {
                warn!(
                    "Error assigning self node id, using unpersisted identity {}: {}",
                    id, e
                );
            }
            id
        }
        Err(e) => {
            let id = NodeId::random();
            warn!(
                "Unable to read self node id, using unpersisted identity {}: {}",
                id, e
            );
            id
        }
    }
}
