//! Predicate-filtered bulk delete, executed on the local node
//!
//! The predicate tree resolves to a key set: `AND` intersects, `OR` unions,
//! leaf comparisons and `IN` lists go to [`DataManager::select_keys_with_pattern`].
//! Keys are then removed concurrently; failures are logged per key and
//! excluded from the row count.

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::common::{Error, ErrorCode, Result};
use crate::protocol::Response;
use crate::storage::{DataManager, Operator};

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Column(String),
    Constant(Value),
    /// A nested select. Never supported in a delete filter.
    Subquery(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Compare {
        left: Operand,
        op: String,
        right: Operand,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    /// Any other expression shape, kept by description for the error message.
    Unsupported(String),
}

impl Predicate {
    pub fn and(left: Predicate, right: Predicate) -> Self {
        Predicate::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Predicate, right: Predicate) -> Self {
        Predicate::Or(Box::new(left), Box::new(right))
    }

    /// `column <op> value`
    pub fn compare(column: &str, op: &str, value: Value) -> Self {
        Predicate::Compare {
            left: Operand::Column(column.to_string()),
            op: op.to_string(),
            right: Operand::Constant(value),
        }
    }

    pub fn is_in(column: &str, values: Vec<Value>) -> Self {
        Predicate::In {
            column: column.to_string(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub datastore: String,
    pub tables: Vec<String>,
    #[serde(default)]
    pub predicate: Option<Predicate>,
}

pub struct BulkDelete {
    data: Arc<dyn DataManager>,
    parallelism: usize,
}

impl BulkDelete {
    pub fn new(data: Arc<dyn DataManager>, parallelism: usize) -> Self {
        Self {
            data,
            parallelism: parallelism.max(1),
        }
    }

    /// Delete every matching record; `rows` counts successful removals.
    pub async fn execute(&self, stmt: &DeleteStatement) -> Result<Response> {
        let collection = match stmt.tables.as_slice() {
            [single] => single.as_str(),
            [] => {
                return Err(Error::operation(
                    ErrorCode::InvalidArgument,
                    "delete names no table",
                ))
            }
            _ => {
                return Err(Error::operation(
                    ErrorCode::OperationNotSupported,
                    "multi-table delete is not supported",
                ))
            }
        };

        let keys: Vec<String> = match &stmt.predicate {
            Some(predicate) => self
                .resolve_keys(&stmt.datastore, collection, predicate)?
                .into_iter()
                .collect(),
            None => self.data.select_all_keys(&stmt.datastore, collection)?,
        };

        let total = keys.len();
        let removed = self.remove_keys(&stmt.datastore, collection, keys).await;
        info!(
            "Deleted {}/{} records from {}.{}",
            removed, total, stmt.datastore, collection
        );
        Ok(Response::with_rows(removed))
    }

    /// Evaluate `predicate` to the set of matching keys.
    pub fn resolve_keys(
        &self,
        datastore: &str,
        collection: &str,
        predicate: &Predicate,
    ) -> Result<HashSet<String>> {
        match predicate {
            Predicate::And(left, right) => {
                let left = self.resolve_keys(datastore, collection, left)?;
                let right = self.resolve_keys(datastore, collection, right)?;
                Ok(left.intersection(&right).cloned().collect())
            }
            Predicate::Or(left, right) => {
                let mut keys = self.resolve_keys(datastore, collection, left)?;
                keys.extend(self.resolve_keys(datastore, collection, right)?);
                Ok(keys)
            }
            Predicate::Compare { left, op, right } => {
                let column = match left {
                    Operand::Column(c) => c,
                    other => return Err(unsupported(format!("left operand {:?}", other))),
                };
                let value = match right {
                    Operand::Constant(v) => v,
                    other => return Err(unsupported(format!("right operand {:?}", other))),
                };
                let op = Operator::from_sql(op)
                    .filter(|op| *op != Operator::In)
                    .ok_or_else(|| unsupported(format!("operator {}", op)))?;
                let keys =
                    self.data
                        .select_keys_with_pattern(datastore, collection, column, value, op)?;
                Ok(keys.into_iter().collect())
            }
            Predicate::In { column, values } => {
                let mut keys = HashSet::new();
                for value in values {
                    match self.data.select_keys_with_pattern(
                        datastore,
                        collection,
                        column,
                        value,
                        Operator::Eq,
                    ) {
                        Ok(found) => keys.extend(found),
                        Err(e) => warn!(
                            "IN lookup of {} = {} in {}.{} failed, skipping: {}",
                            column, value, datastore, collection, e
                        ),
                    }
                }
                Ok(keys)
            }
            Predicate::Unsupported(what) => Err(unsupported(what.clone())),
        }
    }

    async fn remove_keys(&self, datastore: &str, collection: &str, keys: Vec<String>) -> u64 {
        stream::iter(keys)
            .map(|key| {
                let data = Arc::clone(&self.data);
                let datastore = datastore.to_string();
                let collection = collection.to_string();
                async move {
                    let outcome = tokio::task::spawn_blocking({
                        let key = key.clone();
                        move || data.remove(&datastore, &collection, &key)
                    })
                    .await;
                    match outcome {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            warn!("Failed to delete record {}: {}", key, e);
                            false
                        }
                        Err(e) => {
                            warn!("Delete task for record {} panicked: {}", key, e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.parallelism)
            .fold(0u64, |count, ok| async move {
                if ok {
                    count + 1
                } else {
                    count
                }
            })
            .await
    }
}

fn unsupported(what: String) -> Error {
    debug!("Rejecting delete filter: {}", what);
    Error::operation(
        ErrorCode::OperationNotSupported,
        format!("unsupported delete filter: {}", what),
    )
}
