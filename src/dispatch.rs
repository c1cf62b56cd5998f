//! Inbound message dispatch
//!
//! Every decoded message, from any connection or from the loopback channel,
//! lands here. Processing holds one worker permit, bounding how many
//! messages run at once across the node.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cluster::node::NodeId;
use crate::cluster::onboarding::Onboarding;
use crate::cluster::store::ClusterStore;
use crate::connection::{ConnectionRegistry, MessageHandler};
use crate::protocol::{Query, QueryBody, Response};
use crate::storage::DataManager;
use crate::txn::{processor_for, MasterStore, ProcessorStore};

pub struct Dispatcher {
    cluster: Arc<ClusterStore>,
    registry: Arc<ConnectionRegistry>,
    onboarding: Arc<Onboarding>,
    processors: Arc<ProcessorStore>,
    masters: Arc<MasterStore>,
    data: Arc<dyn DataManager>,
    workers: Semaphore,
}

impl Dispatcher {
    pub fn new(
        cluster: Arc<ClusterStore>,
        registry: Arc<ConnectionRegistry>,
        onboarding: Arc<Onboarding>,
        processors: Arc<ProcessorStore>,
        masters: Arc<MasterStore>,
        data: Arc<dyn DataManager>,
        workers: usize,
    ) -> Self {
        Self {
            cluster,
            registry,
            onboarding,
            processors,
            masters,
            data,
            workers: Semaphore::new(workers.max(1)),
        }
    }

    pub async fn dispatch(&self, from: NodeId, query: Query) {
        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Dispatcher closed, dropping {}", query.query_type());
                return;
            }
        };
        let kind = query.query_type();
        debug!("{} from {} (rid {})", kind, from, query.request_id);

        if kind.is_onboarding() {
            self.onboarding.handle(from, query).await;
            return;
        }

        match &query.body {
            // === Participant side ===
            QueryBody::CreateDatastore { .. }
            | QueryBody::DropDatastore { .. }
            | QueryBody::CreateCollection { .. }
            | QueryBody::DropCollection { .. }
            | QueryBody::Insert { .. } => self.soft_commit(from, &query).await,
            QueryBody::ListDatastores | QueryBody::ListCollections { .. } => {
                self.run_read(from, &query).await
            }
            QueryBody::Commit => self.finalize(from, &query, true).await,
            QueryBody::Rollback => self.finalize(from, &query, false).await,

            // === Master side ===
            QueryBody::SoftCommitSuccess
            | QueryBody::CommitSuccess
            | QueryBody::RollbackSuccess
            | QueryBody::QueryResponse(_) => match self.masters.get(&query.request_id) {
                Some(master) => {
                    master.notify_message(from, query.body.clone());
                }
                None => debug!(
                    "{} from {} for unknown request {}",
                    kind, from, query.request_id
                ),
            },

            // === Administration ===
            QueryBody::AddNode { address } => {
                let onboarding = Arc::clone(&self.onboarding);
                let address = address.clone();
                tokio::spawn(async move {
                    if let Err(e) = onboarding.add_node(&address).await {
                        warn!("ADD-NODE {} failed: {}", address, e);
                    }
                });
            }
            QueryBody::ListNodes => {
                let response = Response::nodes(&self.cluster.list_nodes())
                    .unwrap_or_else(|e| Response::failure(&e));
                self.reply(&from, &query, QueryBody::QueryResponse(response))
                    .await;
            }
            QueryBody::DropNode { node_id } => {
                if node_id == self.cluster.self_id() {
                    warn!("Dropped from the cluster by {}", from);
                    return;
                }
                self.cluster.notify_remove_node(node_id);
                self.registry.disconnect_node(node_id).await;
                info!("Node {} dropped (notified by {})", node_id, from);
            }
            QueryBody::Ping => {}
            QueryBody::NodeId(member) => {
                warn!(
                    "Unexpected NODE-ID {} from {} after handshake",
                    member.node_id, from
                );
            }
            other => warn!("Unhandled {} from {}", other.query_type(), from),
        }
    }

    /// Build, soft-commit and register the local processor for a write.
    async fn soft_commit(&self, from: NodeId, query: &Query) {
        if self.processors.is_known(&query.request_id) {
            debug!("Duplicate {} for request {}", query.query_type(), query.request_id);
            return;
        }
        let mut processor = match processor_for(&query.body, Arc::clone(&self.data)) {
            Some(p) => p,
            None => return,
        };

        let body = match processor.soft_commit() {
            Ok(_) => QueryBody::SoftCommitSuccess,
            Err(e) => {
                warn!(
                    "Soft commit of {} (rid {}) failed: {}",
                    query.query_type(),
                    query.request_id,
                    e
                );
                QueryBody::QueryResponse(Response::failure(&e))
            }
        };
        // Registered even on failure so a ROLLBACK can undo partial work.
        if let Err(duplicate) = self.processors.register(&query.request_id, processor) {
            debug!(
                "Request {} was registered concurrently, undoing duplicate soft commit",
                query.request_id
            );
            if let Err(e) = duplicate.rollback() {
                warn!("Undo of duplicate {} failed: {}", query.request_id, e);
            }
            return;
        }
        self.reply(&from, query, body).await;
    }

    async fn run_read(&self, from: NodeId, query: &Query) {
        let response = match processor_for(&query.body, Arc::clone(&self.data)) {
            Some(mut p) => p.soft_commit().unwrap_or_else(|e| Response::failure(&e)),
            None => return,
        };
        self.reply(&from, query, QueryBody::QueryResponse(response))
            .await;
    }

    async fn finalize(&self, from: NodeId, query: &Query, commit: bool) {
        let processor = match self.processors.get_and_unregister(&query.request_id) {
            Some(p) => p,
            None => {
                debug!(
                    "{} for unknown or finished request {}, ignoring",
                    query.query_type(),
                    query.request_id
                );
                return;
            }
        };

        let (result, done) = if commit {
            (processor.commit(), QueryBody::CommitSuccess)
        } else {
            (processor.rollback(), QueryBody::RollbackSuccess)
        };
        let body = match result {
            Ok(()) => done,
            Err(e) => {
                warn!("{} of request {} failed: {}", query.query_type(), query.request_id, e);
                QueryBody::QueryResponse(Response::failure(&e))
            }
        };
        self.reply(&from, query, body).await;
    }

    async fn reply(&self, to: &NodeId, query: &Query, body: QueryBody) {
        if let Err(e) = self.registry.send(to, query.reply(body)).await {
            warn!(
                "Failed to answer {} (rid {}) to {}: {}",
                query.query_type(),
                query.request_id,
                to,
                e
            );
        }
    }
}

impl MessageHandler for Dispatcher {
    fn handle(&self, from: NodeId, query: Query) -> BoxFuture<'_, ()> {
        Box::pin(self.dispatch(from, query))
    }
}
