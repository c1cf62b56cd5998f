//! Storage collaborators
//!
//! The coordination core never touches storage formats directly. Local
//! processors, schema sync and bulk operations go through [`DataManager`];
//! system tables and stored-procedure artifacts go through [`SystemCatalog`].
//! The in-memory implementations back tests and standalone nodes.

pub mod memory;

pub use memory::{MemDataManager, MemSystemCatalog};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::common::Result;
use crate::protocol::{ProcedureArtifact, SystemTables};

/// Comparison operator for key lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
}

impl Operator {
    /// Map an SQL operator token.
    pub fn from_sql(op: &str) -> Option<Operator> {
        match op.trim().to_ascii_uppercase().as_str() {
            "=" | "==" => Some(Operator::Eq),
            "<>" | "!=" => Some(Operator::NotEq),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::LtEq),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::GtEq),
            "IN" => Some(Operator::In),
            _ => None,
        }
    }

    /// Does `field` satisfy `field <op> reference`?
    pub fn matches(&self, field: &Value, reference: &Value) -> bool {
        match self {
            Operator::Eq | Operator::In => values_equal(field, reference),
            Operator::NotEq => !values_equal(field, reference),
            Operator::Lt => compare(field, reference) == Some(Ordering::Less),
            Operator::LtEq => matches!(
                compare(field, reference),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => compare(field, reference) == Some(Ordering::Greater),
            Operator::GtEq => matches!(
                compare(field, reference),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Local storage engine interface.
pub trait DataManager: Send + Sync {
    // === Datastores ===
    fn create_datastore(&self, datastore: &str) -> Result<()>;
    fn drop_datastore(&self, datastore: &str) -> Result<()>;
    fn datastore_exists(&self, datastore: &str) -> bool;
    fn list_datastores(&self) -> Vec<String>;

    // === Collections ===
    fn create_collection(&self, datastore: &str, collection: &str, schema: &Value) -> Result<()>;
    fn drop_collection(&self, datastore: &str, collection: &str) -> Result<()>;
    fn collection_exists(&self, datastore: &str, collection: &str) -> bool;
    fn list_collections(&self, datastore: &str) -> Result<Vec<String>>;
    fn collection_schema(&self, datastore: &str, collection: &str) -> Result<Value>;

    // === Records ===
    fn insert(&self, datastore: &str, collection: &str, key: &str, data: Value) -> Result<()>;
    fn select(&self, datastore: &str, collection: &str, key: &str) -> Result<Option<Value>>;
    fn remove(&self, datastore: &str, collection: &str, key: &str) -> Result<()>;
    fn select_all_keys(&self, datastore: &str, collection: &str) -> Result<Vec<String>>;

    /// Keys of records whose `column` satisfies `column <op> value`.
    fn select_keys_with_pattern(
        &self,
        datastore: &str,
        collection: &str,
        column: &str,
        value: &Value,
        op: Operator,
    ) -> Result<Vec<String>>;
}

/// System tables (users, procedure registry) and procedure artifacts.
pub trait SystemCatalog: Send + Sync {
    fn export_tables(&self) -> Result<SystemTables>;
    fn import_tables(&self, tables: SystemTables) -> Result<()>;
    fn export_procedures(&self) -> Result<Vec<ProcedureArtifact>>;
    /// Store and load the given artifacts.
    fn load_procedures(&self, procedures: Vec<ProcedureArtifact>) -> Result<()>;
}
