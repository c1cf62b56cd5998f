//! Coordinator-side acknowledgement tracking
//!
//! A [`MasterExecutable`] exists for each distributed request this node
//! coordinates. Participant replies (SCS, CS, RS, QR) are routed to it by
//! request id; it records one acknowledgement per (node, reply kind) and
//! forwards new ones to the waiting coordinator.

use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::node::NodeId;
use crate::protocol::{QueryBody, QueryType};

pub struct MasterExecutable {
    request_id: String,
    participants: HashSet<NodeId>,
    seen: DashSet<(NodeId, QueryType)>,
    tx: mpsc::UnboundedSender<(NodeId, QueryBody)>,
}

impl MasterExecutable {
    pub fn new(
        request_id: impl Into<String>,
        participants: impl IntoIterator<Item = NodeId>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(NodeId, QueryBody)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let master = Arc::new(Self {
            request_id: request_id.into(),
            participants: participants.into_iter().collect(),
            seen: DashSet::new(),
            tx,
        });
        (master, rx)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn participants(&self) -> &HashSet<NodeId> {
        &self.participants
    }

    /// Record a participant reply. Returns false when the reply is ignored
    /// (unknown sender, duplicate, or not an acknowledgement).
    pub fn notify_message(&self, from: NodeId, body: QueryBody) -> bool {
        let kind = body.query_type();
        if !kind.is_master_ack() {
            warn!("{} is not an acknowledgement, ignoring", kind);
            return false;
        }
        if !self.participants.contains(&from) {
            warn!(
                "Request {}: {} from non-participant {}",
                self.request_id, kind, from
            );
            return false;
        }
        if !self.seen.insert((from.clone(), kind)) {
            debug!("Request {}: duplicate {} from {}", self.request_id, kind, from);
            return false;
        }
        // The receiver is gone once the coordinator finished; late acks are dropped.
        self.tx.send((from, body)).is_ok()
    }
}

#[derive(Default)]
pub struct MasterStore {
    masters: DashMap<String, Arc<MasterExecutable>>,
}

impl MasterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, master: Arc<MasterExecutable>) {
        self.masters.insert(master.request_id.clone(), master);
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<MasterExecutable>> {
        self.masters.get(request_id).map(|m| Arc::clone(&m))
    }

    pub fn unregister(&self, request_id: &str) -> Option<Arc<MasterExecutable>> {
        self.masters.remove(request_id).map(|(_, m)| m)
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }
}
