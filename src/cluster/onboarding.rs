//! Node onboarding
//!
//! The coordinating member drives a joining node through ONB1..ONB5_2, one
//! phase at a time, and waits for each phase ACK before sending the next:
//!
//! ```text
//! ONB1    cluster id + member list          joiner: NEW_NODE
//! ONB2    datastore/collection schemas      joiner: SYNCING
//! ONB3    system tables
//! ONB4    stored-procedure artifacts
//! ONB5_1  (to existing members) dial the new node
//! ONB5_2  (to joiner) dial every member
//! ONB_SUCCESS                               joiner: CONNECTED
//! ```
//!
//! A failed or missing ACK aborts onboarding: the node is marked DOWN and
//! never added. A joiner whose session sees no onboarding message for the
//! sync timeout (ONB_SUCCESS after ONB5_2, or the next phase before that)
//! gives the session up: SYNCING → DOWN, NEW_NODE → UNKNOWN. DOWN is
//! terminal for the session, and a late ONB_SUCCESS is ignored.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::cluster::node::{Member, NodeId, NodeStatus};
use crate::cluster::store::ClusterStore;
use crate::common::{generate_request_id, Error, ErrorCode, Result};
use crate::connection::ConnectionRegistry;
use crate::protocol::{
    Ack, CollectionSchema, DatastoreSchema, Query, QueryBody, QueryType,
};
use crate::storage::{DataManager, SystemCatalog};

/// State of this node's own onboarding, when it is the joiner.
#[derive(Default)]
struct JoinSession {
    session: Option<String>,
    coordinator: Option<NodeId>,
    cluster_id: Option<String>,
    members: Vec<Member>,
    /// Bumped on every onboarding message; the inactivity timer only fires
    /// if nothing happened since it was armed.
    activity: u64,
}

pub struct Onboarding {
    cluster: Arc<ClusterStore>,
    registry: Arc<ConnectionRegistry>,
    data: Arc<dyn DataManager>,
    catalog: Arc<dyn SystemCatalog>,
    phase_timeout: Duration,
    sync_timeout: Duration,
    /// Coordinator side: the waiter for the next ACK of each running session.
    pending: DashMap<String, oneshot::Sender<(NodeId, QueryBody)>>,
    join: Mutex<JoinSession>,
}

impl Onboarding {
    pub fn new(
        cluster: Arc<ClusterStore>,
        registry: Arc<ConnectionRegistry>,
        data: Arc<dyn DataManager>,
        catalog: Arc<dyn SystemCatalog>,
        phase_timeout: Duration,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            registry,
            data,
            catalog,
            phase_timeout,
            sync_timeout,
            pending: DashMap::new(),
            join: Mutex::new(JoinSession::default()),
        }
    }

    // === Coordinator side ===

    /// Onboard the node listening at `addr` into this node's cluster.
    pub async fn add_node(&self, addr: &str) -> Result<NodeId> {
        if !self.cluster.is_clustered() {
            return Err(Error::operation(
                ErrorCode::NotAMember,
                "node is not part of a cluster; create one first",
            ));
        }

        let node = self.registry.connect(addr).await?;
        if self.cluster.has_node(&node)
            && self.cluster.node_status(&node) == Some(NodeStatus::Connected)
        {
            info!("Node {} at {} is already a connected member", node, addr);
            return Ok(node);
        }

        let session = generate_request_id();
        info!("Onboarding node {} at {} (session {})", node, addr, session);
        self.cluster.set_node_status(&node, NodeStatus::NewNode);

        match self.drive(&session, &node).await {
            Ok(()) => {
                info!("Node {} joined the cluster", node);
                Ok(node)
            }
            Err(e) => {
                self.pending.remove(&session);
                error!("Onboarding of node {} aborted: {}", node, e);
                self.cluster.set_node_status(&node, NodeStatus::Down);
                self.registry.disconnect_node(&node).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, session: &str, node: &NodeId) -> Result<()> {
        let cluster_id = self.cluster.cluster_id().ok_or_else(|| {
            Error::operation(ErrorCode::NotAMember, "cluster id vanished during onboarding")
        })?;

        self.phase(
            session,
            node,
            QueryBody::Onb1 {
                cluster_id,
                members: self.cluster.member_list(),
            },
        )
        .await?;
        self.cluster.set_node_status(node, NodeStatus::Syncing);

        let schemas = self.export_schemas().map_err(|e| failed(node, QueryType::Onb2, e))?;
        self.phase(session, node, QueryBody::Onb2 { schemas }).await?;

        let tables = self
            .catalog
            .export_tables()
            .map_err(|e| failed(node, QueryType::Onb3, e))?;
        self.phase(session, node, QueryBody::Onb3 { tables }).await?;

        let procedures = self
            .catalog
            .export_procedures()
            .map_err(|e| failed(node, QueryType::Onb4, e))?;
        self.phase(session, node, QueryBody::Onb4 { procedures })
            .await?;

        // Existing members dial the new node; their acks are informational.
        let peers = self.cluster.peers();
        let announce = Query::new(
            session,
            QueryBody::Onb51 {
                member: Member {
                    node_id: node.clone(),
                    address: self.cluster.address(node),
                },
            },
        );
        for (peer, e) in self.registry.broadcast(&peers, &announce).await {
            warn!("ONB5_1 for {} not delivered to {}: {}", node, peer, e);
        }

        self.phase(
            session,
            node,
            QueryBody::Onb52 {
                members: self.cluster.member_list(),
            },
        )
        .await?;

        self.cluster.notify_add_node(node);
        self.cluster.set_node_status(node, NodeStatus::Connected);

        let success = Query::new(
            session,
            QueryBody::OnbSuccess {
                node_id: node.clone(),
                members: self.cluster.member_list(),
            },
        );
        for (peer, e) in self.registry.broadcast(&self.cluster.peers(), &success).await {
            warn!("ONB_SUCCESS for {} not delivered to {}: {}", node, peer, e);
        }
        Ok(())
    }

    /// Send one phase message and wait for its ACK.
    async fn phase(&self, session: &str, node: &NodeId, body: QueryBody) -> Result<()> {
        let phase = body.query_type();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(session.to_string(), tx);

        debug!("Session {}: sending {} to {}", session, phase, node);
        if let Err(e) = self.registry.send(node, Query::new(session, body)).await {
            self.pending.remove(session);
            return Err(failed(node, phase, e));
        }

        let (from, reply) = match tokio::time::timeout(self.phase_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(failed(node, phase, "ack waiter dropped")),
            Err(_) => {
                self.pending.remove(session);
                return Err(failed(
                    node,
                    phase,
                    format!("no ACK within {:?}", self.phase_timeout),
                ));
            }
        };

        if &from != node {
            return Err(failed(node, phase, format!("ACK came from {}", from)));
        }
        if Some(reply.query_type()) != ack_for(phase) {
            return Err(failed(
                node,
                phase,
                format!("expected ACK for {}, got {}", phase, reply.query_type()),
            ));
        }
        match reply.onboarding_ack() {
            Some(ack) if ack.ok => Ok(()),
            Some(ack) => Err(failed(
                node,
                phase,
                ack.cause.clone().unwrap_or_else(|| "rejected".into()),
            )),
            None => Err(failed(node, phase, "ACK without payload")),
        }
    }

    fn export_schemas(&self) -> Result<Vec<DatastoreSchema>> {
        let mut schemas = Vec::new();
        for datastore in self.data.list_datastores() {
            let mut collections = Vec::new();
            for name in self.data.list_collections(&datastore)? {
                let schema = self.data.collection_schema(&datastore, &name)?;
                collections.push(CollectionSchema { name, schema });
            }
            schemas.push(DatastoreSchema {
                datastore,
                collections,
            });
        }
        Ok(schemas)
    }

    // === Message handling ===

    /// Handle an onboarding message received from `from`.
    pub async fn handle(self: &Arc<Self>, from: NodeId, query: Query) {
        let reply = match &query.body {
            QueryBody::Onb1Ack(_)
            | QueryBody::Onb2Ack(_)
            | QueryBody::Onb3Ack(_)
            | QueryBody::Onb4Ack(_)
            | QueryBody::Onb52Ack(_) => {
                match self.pending.remove(&query.request_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send((from, query.body.clone()));
                    }
                    None => debug!(
                        "{} for unknown onboarding session {}",
                        query.query_type(),
                        query.request_id
                    ),
                }
                return;
            }
            QueryBody::Onb51Ack(ack) => {
                if !ack.ok {
                    warn!("Member {} could not reach the joining node: {:?}", from, ack.cause);
                }
                return;
            }
            QueryBody::Onb1 {
                cluster_id,
                members,
            } => QueryBody::Onb1Ack(self.on_onb1(&from, &query.request_id, cluster_id, members).await),
            QueryBody::Onb2 { schemas } => {
                let ack = self
                    .in_session(&query.request_id, || {
                        self.cluster
                            .set_node_status(self.cluster.self_id(), NodeStatus::Syncing);
                        self.apply_schemas(schemas)
                    })
                    .await;
                QueryBody::Onb2Ack(ack)
            }
            QueryBody::Onb3 { tables } => {
                let ack = self
                    .in_session(&query.request_id, || self.catalog.import_tables(tables.clone()))
                    .await;
                QueryBody::Onb3Ack(ack)
            }
            QueryBody::Onb4 { procedures } => {
                let ack = self
                    .in_session(&query.request_id, || {
                        self.catalog.load_procedures(procedures.clone())
                    })
                    .await;
                QueryBody::Onb4Ack(ack)
            }
            QueryBody::Onb51 { member } => QueryBody::Onb51Ack(self.on_onb51(member).await),
            QueryBody::Onb52 { members } => {
                QueryBody::Onb52Ack(self.on_onb52(&query.request_id, members).await)
            }
            QueryBody::OnbSuccess { node_id, members } => {
                self.on_success(&from, node_id, members).await;
                return;
            }
            other => {
                warn!("{} is not an onboarding message", other.query_type());
                return;
            }
        };

        if let Err(e) = self.registry.send(&from, query.reply(reply)).await {
            warn!("Failed to answer {} from {}: {}", query.query_type(), from, e);
        }
    }

    // === Joiner side ===

    async fn on_onb1(
        self: &Arc<Self>,
        from: &NodeId,
        session: &str,
        cluster_id: &str,
        members: &[Member],
    ) -> Ack {
        if let Some(current) = self.cluster.cluster_id() {
            if current != cluster_id {
                warn!(
                    "Refusing onboarding into cluster {} from {}: already in cluster {}",
                    cluster_id, from, current
                );
                return Ack::failed(format!("already a member of cluster {}", current));
            }
        }

        let mut join = self.join.lock().await;
        if let Some(previous) = &join.session {
            if previous != session {
                warn!("Abandoning onboarding session {} for {}", previous, session);
            }
        }
        join.session = Some(session.to_string());
        join.coordinator = Some(from.clone());
        join.cluster_id = Some(cluster_id.to_string());
        join.members = members.to_vec();
        join.activity += 1;
        self.arm_inactivity_timer(join.activity);
        for member in members {
            if let Some(addr) = &member.address {
                self.cluster.record_address(&member.node_id, addr);
            }
        }
        self.cluster
            .set_node_status(self.cluster.self_id(), NodeStatus::NewNode);
        info!("Onboarding into cluster {} coordinated by {}", cluster_id, from);
        Ack::ok()
    }

    /// Run one local sync step within the current session.
    async fn in_session<F>(self: &Arc<Self>, session: &str, step: F) -> Ack
    where
        F: FnOnce() -> Result<()>,
    {
        let mut join = self.join.lock().await;
        if join.session.as_deref() != Some(session) {
            return Ack::failed(format!("unknown onboarding session {}", session));
        }
        join.activity += 1;
        self.arm_inactivity_timer(join.activity);
        let result = step();
        if let Err(e) = &result {
            warn!("Onboarding step failed: {}", e);
        }
        Ack::from_result(&result)
    }

    fn apply_schemas(&self, schemas: &[DatastoreSchema]) -> Result<()> {
        for ds in schemas {
            if !self.data.datastore_exists(&ds.datastore) {
                self.data.create_datastore(&ds.datastore)?;
            }
            for collection in &ds.collections {
                if !self.data.collection_exists(&ds.datastore, &collection.name) {
                    self.data
                        .create_collection(&ds.datastore, &collection.name, &collection.schema)?;
                }
            }
        }
        debug!("Replicated {} datastore schemas", schemas.len());
        Ok(())
    }

    async fn on_onb52(self: &Arc<Self>, session: &str, members: &[Member]) -> Ack {
        {
            let join = self.join.lock().await;
            if join.session.as_deref() != Some(session) {
                return Ack::failed(format!("unknown onboarding session {}", session));
            }
        }

        // Dial outside the session lock; handshakes can take a while.
        let mut unreachable = Vec::new();
        for member in members {
            if &member.node_id == self.cluster.self_id() || self.registry.is_connected(&member.node_id) {
                continue;
            }
            let result = match &member.address {
                Some(addr) => self.registry.connect(addr).await.map(|_| ()),
                None => Err(Error::NotConnected(member.node_id.to_string())),
            };
            if let Err(e) = result {
                warn!("Cannot reach member {}: {}", member.node_id, e);
                unreachable.push(member.node_id.to_string());
            }
        }

        let mut join = self.join.lock().await;
        if join.session.as_deref() != Some(session) {
            return Ack::failed(format!("onboarding session {} was superseded", session));
        }
        join.activity += 1;
        self.arm_inactivity_timer(join.activity);
        if !unreachable.is_empty() {
            return Ack::failed(format!("cannot reach {}", unreachable.join(", ")));
        }
        join.members = members.to_vec();

        debug!("Connected to all {} members, awaiting ONB_SUCCESS", members.len());
        Ack::ok()
    }

    /// Give up the session if no onboarding message arrives within the sync
    /// timeout of activity generation `armed`.
    fn arm_inactivity_timer(self: &Arc<Self>, armed: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.sync_timeout).await;
            this.on_inactivity(armed).await;
        });
    }

    async fn on_inactivity(&self, armed: u64) {
        let mut join = self.join.lock().await;
        if join.activity != armed {
            return;
        }
        let session = match join.session.take() {
            Some(session) => session,
            None => return,
        };
        let self_id = self.cluster.self_id();
        if self
            .cluster
            .transition_status(self_id, NodeStatus::Syncing, NodeStatus::Down)
        {
            warn!(
                "Onboarding session {} idle for {:?}, node is DOWN",
                session, self.sync_timeout
            );
        } else if self
            .cluster
            .transition_status(self_id, NodeStatus::NewNode, NodeStatus::Unknown)
        {
            warn!("Onboarding session {} abandoned by the coordinator", session);
        }
    }

    async fn on_success(&self, from: &NodeId, node_id: &NodeId, members: &[Member]) {
        if node_id != self.cluster.self_id() {
            self.cluster.notify_add_node(node_id);
            self.cluster.set_node_status(node_id, NodeStatus::Connected);
            info!("Node {} joined the cluster (announced by {})", node_id, from);
            self.adopt_members(members).await;
            return;
        }

        {
            let mut join = self.join.lock().await;
            let cluster_id = match join.cluster_id.clone() {
                Some(id) if join.session.is_some() => id,
                _ => {
                    warn!(
                        "ONB_SUCCESS from {} outside an onboarding session, ignoring (status {})",
                        from,
                        self.cluster.self_status()
                    );
                    return;
                }
            };
            if join.coordinator.as_ref() != Some(from) {
                debug!("ONB_SUCCESS relayed by {} rather than the coordinator", from);
            }
            join.activity += 1;
            join.session = None;

            let self_id = self.cluster.self_id();
            if !self
                .cluster
                .transition_status(self_id, NodeStatus::Syncing, NodeStatus::Connected)
            {
                warn!(
                    "ONB_SUCCESS from {} ignored: status is {}",
                    from,
                    self.cluster.self_status()
                );
                return;
            }
            if let Err(e) = self.cluster.join_cluster(&cluster_id, &join.members) {
                error!("Failed to record membership of cluster {}: {}", cluster_id, e);
                self.cluster.set_node_status(self_id, NodeStatus::Down);
                return;
            }
            info!("Joined cluster {}", cluster_id);
        }

        self.adopt_members(members).await;
    }

    /// Add and dial members announced with ONB_SUCCESS that this node has
    /// not seen, such as a node that finished joining concurrently.
    async fn adopt_members(&self, members: &[Member]) {
        for member in members {
            if &member.node_id == self.cluster.self_id() || self.cluster.has_node(&member.node_id) {
                continue;
            }
            if let Some(addr) = &member.address {
                self.cluster.record_address(&member.node_id, addr);
            }
            self.cluster.notify_add_node(&member.node_id);
            info!("Learned of cluster member {} from ONB_SUCCESS", member.node_id);

            if self.registry.is_connected(&member.node_id) {
                self.cluster
                    .set_node_status(&member.node_id, NodeStatus::Connected);
                continue;
            }
            let dialed = match &member.address {
                Some(addr) => self.registry.connect(addr).await.map(|_| ()),
                None => Err(Error::NotConnected(member.node_id.to_string())),
            };
            match dialed {
                Ok(()) => self
                    .cluster
                    .set_node_status(&member.node_id, NodeStatus::Connected),
                Err(e) => {
                    warn!("Cannot reach member {}: {}", member.node_id, e);
                    self.cluster.set_node_status(&member.node_id, NodeStatus::Down);
                }
            }
        }
    }

    // === Existing member side ===

    async fn on_onb51(&self, member: &Member) -> Ack {
        if &member.node_id == self.cluster.self_id() {
            return Ack::ok();
        }
        if !self.registry.is_connected(&member.node_id) {
            let addr = match &member.address {
                Some(addr) => addr,
                None => return Ack::failed(format!("no address for {}", member.node_id)),
            };
            match self.registry.connect(addr).await {
                Ok(id) if id == member.node_id => {}
                Ok(id) => {
                    warn!("{} answered as {}, expected {}", addr, id, member.node_id);
                    return Ack::failed(format!("{} is node {}", addr, id));
                }
                Err(e) => {
                    warn!("Cannot reach joining node {}: {}", member.node_id, e);
                    return Ack::failed(e.to_string());
                }
            }
        }
        // ONB_SUCCESS may already have arrived over another pooled connection.
        if !self
            .cluster
            .set_status_unless_connected(&member.node_id, NodeStatus::Syncing)
        {
            debug!(
                "Joining node {} already {:?}",
                member.node_id,
                self.cluster.node_status(&member.node_id)
            );
        }
        Ack::ok()
    }
}

fn ack_for(phase: QueryType) -> Option<QueryType> {
    match phase {
        QueryType::Onb1 => Some(QueryType::Onb1Ack),
        QueryType::Onb2 => Some(QueryType::Onb2Ack),
        QueryType::Onb3 => Some(QueryType::Onb3Ack),
        QueryType::Onb4 => Some(QueryType::Onb4Ack),
        QueryType::Onb52 => Some(QueryType::Onb52Ack),
        _ => None,
    }
}

fn failed(node: &NodeId, phase: QueryType, cause: impl ToString) -> Error {
    Error::OnboardingFailed {
        node: node.to_string(),
        phase: phase.to_string(),
        cause: cause.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_for_phases() {
        assert_eq!(ack_for(QueryType::Onb2), Some(QueryType::Onb2Ack));
        assert_eq!(ack_for(QueryType::Onb52), Some(QueryType::Onb52Ack));
        assert_eq!(ack_for(QueryType::Onb51), None);
    }

    #[test]
    fn test_failed_error_shape() {
        let err = failed(&NodeId::new("n1"), QueryType::Onb3, "disk full");
        assert_eq!(err.to_string(), "Onboarding of n1 failed at ONB3: disk full");
    }
}
