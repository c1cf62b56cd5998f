//! Cluster administration entry points

use std::sync::Arc;
use tracing::{info, warn};

use crate::cluster::node::{NodeId, NodeInfo};
use crate::cluster::onboarding::Onboarding;
use crate::cluster::store::ClusterStore;
use crate::common::{Error, ErrorCode, Result};
use crate::connection::ConnectionRegistry;
use crate::protocol::{Query, QueryBody};

pub struct ClusterManager {
    cluster: Arc<ClusterStore>,
    registry: Arc<ConnectionRegistry>,
    onboarding: Arc<Onboarding>,
}

impl ClusterManager {
    pub fn new(
        cluster: Arc<ClusterStore>,
        registry: Arc<ConnectionRegistry>,
        onboarding: Arc<Onboarding>,
    ) -> Self {
        Self {
            cluster,
            registry,
            onboarding,
        }
    }

    /// Make this standalone node the first member of a new cluster.
    pub fn create_cluster(&self) -> Result<String> {
        let id = self.cluster.create_cluster()?;
        info!("Created cluster {}", id);
        Ok(id)
    }

    /// Onboard the node listening at `addr`.
    pub async fn add_node(&self, addr: &str) -> Result<NodeId> {
        self.onboarding.add_node(addr).await
    }

    /// Remove a member everywhere and close its connections.
    pub async fn drop_node(&self, node_id: &NodeId) -> Result<()> {
        if node_id == self.cluster.self_id() {
            return Err(Error::operation(
                ErrorCode::InvalidArgument,
                "a node cannot drop itself",
            ));
        }
        if !self.cluster.has_node(node_id) {
            return Err(Error::operation(
                ErrorCode::NotAMember,
                format!("node {} is not a cluster member", node_id),
            ));
        }

        self.cluster.notify_remove_node(node_id);
        let notice = Query::bare(QueryBody::DropNode {
            node_id: node_id.clone(),
        });
        for (peer, e) in self.registry.broadcast(&self.cluster.peers(), &notice).await {
            warn!("DROP-NODE {} not delivered to {}: {}", node_id, peer, e);
        }
        self.registry.disconnect_node(node_id).await;
        info!("Dropped node {}", node_id);
        Ok(())
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.cluster.list_nodes()
    }
}
