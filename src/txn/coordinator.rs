//! Master side of a distributed operation
//!
//! Write operations run soft-commit → commit/rollback across every
//! participant. Read operations collect one QR per participant and merge
//! the listings.

use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::node::NodeId;
use crate::cluster::store::ClusterStore;
use crate::common::{generate_request_id, Error, ErrorCode, Result};
use crate::connection::ConnectionRegistry;
use crate::protocol::{Query, QueryBody, QueryType, Record, Response};
use crate::txn::master::{MasterExecutable, MasterStore};

pub struct TransactionCoordinator {
    cluster: Arc<ClusterStore>,
    registry: Arc<ConnectionRegistry>,
    masters: Arc<MasterStore>,
    ack_timeout: Duration,
}

/// Replies gathered for one phase.
#[derive(Default)]
struct Collected {
    acked: Vec<NodeId>,
    responses: Vec<(NodeId, Response)>,
    failed: Vec<(NodeId, Response)>,
    missing: HashSet<NodeId>,
}

impl Collected {
    fn responded(&self) -> impl Iterator<Item = &NodeId> {
        self.acked
            .iter()
            .chain(self.responses.iter().map(|(n, _)| n))
            .chain(self.failed.iter().map(|(n, _)| n))
    }
}

/// Unregisters the master record when the operation finishes, however it ends.
struct MasterGuard<'a> {
    masters: &'a MasterStore,
    request_id: String,
}

impl Drop for MasterGuard<'_> {
    fn drop(&mut self) {
        if self.masters.unregister(&self.request_id).is_some() {
            debug!("Unregistered master for request {}", self.request_id);
        }
    }
}

impl TransactionCoordinator {
    pub fn new(
        cluster: Arc<ClusterStore>,
        registry: Arc<ConnectionRegistry>,
        masters: Arc<MasterStore>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            registry,
            masters,
            ack_timeout,
        }
    }

    /// Run `body` on every cluster member, self included.
    pub async fn execute(&self, body: QueryBody) -> Result<Response> {
        let participants = self.cluster.all_nodes();
        self.execute_on(body, participants).await
    }

    /// Run `body` on the given participants.
    pub async fn execute_on(&self, body: QueryBody, participants: Vec<NodeId>) -> Result<Response> {
        if !is_distributed(&body) {
            return Err(Error::operation(
                ErrorCode::OperationNotSupported,
                format!("{} cannot be run as a distributed operation", body.query_type()),
            ));
        }
        if participants.is_empty() {
            return Err(Error::operation(
                ErrorCode::InvalidArgument,
                "no participants for distributed operation",
            ));
        }

        let request_id = generate_request_id();
        let kind = body.query_type();
        let read_only = body.is_read_only();
        let rows = match &body {
            QueryBody::Insert { records, .. } => Some(records.len() as u64),
            _ => None,
        };

        let (master, rx) = MasterExecutable::new(request_id.clone(), participants.clone());
        self.masters.register(master);
        let _guard = MasterGuard {
            masters: &self.masters,
            request_id: request_id.clone(),
        };

        info!(
            "Request {}: {} on {} participant(s)",
            request_id,
            kind,
            participants.len()
        );
        let query = Query::new(request_id.clone(), body);
        let unreachable = self.registry.broadcast(&participants, &query).await;
        for (node, e) in &unreachable {
            warn!("Request {}: {} not delivered to {}: {}", request_id, kind, node, e);
        }

        if read_only {
            self.finish_read(&request_id, rx, &participants, unreachable)
                .await
        } else {
            self.finish_write(&request_id, rx, &participants, unreachable, rows)
                .await
        }
    }

    // === Phases ===

    async fn finish_read(
        &self,
        request_id: &str,
        mut rx: mpsc::UnboundedReceiver<(NodeId, QueryBody)>,
        participants: &[NodeId],
        unreachable: Vec<(NodeId, Error)>,
    ) -> Result<Response> {
        if let Some((node, e)) = unreachable.into_iter().next() {
            return Err(Error::TransactionAborted {
                request_id: request_id.to_string(),
                cause: format!("participant {} unreachable: {}", node, e),
            });
        }

        let collected = self
            .collect(&mut rx, QueryType::QueryResponse, participants.iter().cloned().collect())
            .await;
        if let Some((node, response)) = collected.failed.first() {
            debug!("Request {}: {} reported failure", request_id, node);
            return Err(response
                .to_error()
                .unwrap_or_else(|| Error::Internal("failed response without cause".into())));
        }
        if !collected.missing.is_empty() {
            return Err(Error::Timeout(format!(
                "request {}: no response from {}",
                request_id,
                join_ids(&collected.missing)
            )));
        }
        Ok(Response::with_data(merge_listings(collected.responses)))
    }

    async fn finish_write(
        &self,
        request_id: &str,
        mut rx: mpsc::UnboundedReceiver<(NodeId, QueryBody)>,
        participants: &[NodeId],
        unreachable: Vec<(NodeId, Error)>,
        rows: Option<u64>,
    ) -> Result<Response> {
        let unreachable_ids: HashSet<NodeId> = unreachable.iter().map(|(n, _)| n.clone()).collect();
        let reachable: HashSet<NodeId> = participants
            .iter()
            .filter(|n| !unreachable_ids.contains(*n))
            .cloned()
            .collect();

        let soft = self
            .collect(&mut rx, QueryType::SoftCommitSuccess, reachable.clone())
            .await;

        let abort = if let Some((node, e)) = unreachable.into_iter().next() {
            Some(Error::TransactionAborted {
                request_id: request_id.to_string(),
                cause: format!("participant {} unreachable: {}", node, e),
            })
        } else if let Some((node, response)) = soft.failed.first() {
            debug!("Request {}: soft commit failed on {}", request_id, node);
            response.to_error()
        } else if !soft.missing.is_empty() {
            Some(Error::TransactionAborted {
                request_id: request_id.to_string(),
                cause: format!("no soft commit ack from {}", join_ids(&soft.missing)),
            })
        } else {
            None
        };

        match abort {
            None => {
                let commit = Query::new(request_id, QueryBody::Commit);
                for (node, e) in self.registry.broadcast(participants, &commit).await {
                    warn!("Request {}: COMMIT not delivered to {}: {}", request_id, node, e);
                }
                let done = self
                    .collect(&mut rx, QueryType::CommitSuccess, reachable)
                    .await;
                for (node, response) in &done.failed {
                    warn!(
                        "Request {}: commit failed on {}: {:?}",
                        request_id, node, response.cause
                    );
                }
                if !done.missing.is_empty() {
                    warn!(
                        "Request {}: no commit ack from {}",
                        request_id,
                        join_ids(&done.missing)
                    );
                }
                info!("Request {} committed", request_id);
                Ok(match rows {
                    Some(rows) => Response::with_rows(rows),
                    None => Response::ok(),
                })
            }
            Some(err) => {
                warn!("Request {} rolling back: {}", request_id, err);
                let holders: HashSet<NodeId> = soft.responded().cloned().collect();
                let rollback = Query::new(request_id, QueryBody::Rollback);
                for (node, e) in self.registry.broadcast(participants, &rollback).await {
                    debug!("Request {}: ROLLBACK not delivered to {}: {}", request_id, node, e);
                }
                let done = self
                    .collect(&mut rx, QueryType::RollbackSuccess, holders)
                    .await;
                if !done.missing.is_empty() {
                    warn!(
                        "Request {}: no rollback ack from {}",
                        request_id,
                        join_ids(&done.missing)
                    );
                }
                Err(err)
            }
        }
    }

    /// Wait until every node in `waiting` replied with `expected` (or a
    /// failed QR), or the ack timeout elapses.
    async fn collect(
        &self,
        rx: &mut mpsc::UnboundedReceiver<(NodeId, QueryBody)>,
        expected: QueryType,
        mut waiting: HashSet<NodeId>,
    ) -> Collected {
        let deadline = Instant::now() + self.ack_timeout;
        let mut collected = Collected::default();

        while !waiting.is_empty() {
            let (from, body) = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => break,
            };
            if !waiting.contains(&from) {
                continue;
            }
            match body {
                QueryBody::QueryResponse(response) if !response.ack => {
                    waiting.remove(&from);
                    collected.failed.push((from, response));
                }
                QueryBody::QueryResponse(response) if expected == QueryType::QueryResponse => {
                    waiting.remove(&from);
                    collected.responses.push((from, response));
                }
                other if other.query_type() == expected => {
                    waiting.remove(&from);
                    collected.acked.push(from);
                }
                other => debug!("Ignoring {} from {} while awaiting {}", other.query_type(), from, expected),
            }
        }

        collected.missing = waiting;
        collected
    }

    // === Convenience operations ===

    pub async fn create_datastore(&self, datastore: &str) -> Result<()> {
        self.execute(QueryBody::CreateDatastore {
            datastore: datastore.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn drop_datastore(&self, datastore: &str) -> Result<()> {
        self.execute(QueryBody::DropDatastore {
            datastore: datastore.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn list_datastores(&self) -> Result<Vec<String>> {
        let response = self.execute(QueryBody::ListDatastores).await?;
        Ok(listing(response))
    }

    pub async fn create_collection(&self, datastore: &str, collection: &str, schema: Value) -> Result<()> {
        self.execute(QueryBody::CreateCollection {
            datastore: datastore.to_string(),
            collection: collection.to_string(),
            schema,
        })
        .await
        .map(|_| ())
    }

    pub async fn drop_collection(&self, datastore: &str, collection: &str) -> Result<()> {
        self.execute(QueryBody::DropCollection {
            datastore: datastore.to_string(),
            collection: collection.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn list_collections(&self, datastore: &str) -> Result<Vec<String>> {
        let response = self
            .execute(QueryBody::ListCollections {
                datastore: datastore.to_string(),
            })
            .await?;
        Ok(listing(response))
    }

    /// Insert rows on every member. Rows carrying a string `_id` keep it as
    /// their key; the rest get a fresh one.
    pub async fn insert(&self, datastore: &str, collection: &str, rows: Vec<Value>) -> Result<u64> {
        let records = rows
            .into_iter()
            .map(|data| Record {
                key: data
                    .get("_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(generate_request_id),
                data,
            })
            .collect();
        let response = self
            .execute(QueryBody::Insert {
                datastore: datastore.to_string(),
                collection: collection.to_string(),
                records,
            })
            .await?;
        Ok(response.rows.unwrap_or(0))
    }
}

fn is_distributed(body: &QueryBody) -> bool {
    matches!(
        body,
        QueryBody::CreateDatastore { .. }
            | QueryBody::DropDatastore { .. }
            | QueryBody::ListDatastores
            | QueryBody::CreateCollection { .. }
            | QueryBody::DropCollection { .. }
            | QueryBody::ListCollections { .. }
            | QueryBody::Insert { .. }
    )
}

/// Union of the name listings returned by each participant, sorted.
fn merge_listings(responses: Vec<(NodeId, Response)>) -> Value {
    let mut names = BTreeSet::new();
    for (_, response) in responses {
        if let Some(Value::Array(items)) = response.data {
            names.extend(items.into_iter().filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            }));
        }
    }
    Value::from(names.into_iter().collect::<Vec<_>>())
}

fn listing(response: Response) -> Vec<String> {
    match response.data {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn join_ids<'a>(ids: impl IntoIterator<Item = &'a NodeId>) -> String {
    let mut ids: Vec<&str> = ids.into_iter().map(NodeId::as_str).collect();
    ids.sort_unstable();
    ids.join(", ")
}
