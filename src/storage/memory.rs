//! In-memory storage collaborators

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::common::{Error, ErrorCode, Result};
use crate::protocol::{ProcedureArtifact, SystemTables};
use crate::storage::{DataManager, Operator, SystemCatalog};

#[derive(Default)]
struct Collection {
    schema: Value,
    rows: DashMap<String, Value>,
}

#[derive(Default)]
struct Datastore {
    collections: DashMap<String, Arc<Collection>>,
}

/// DashMap-backed data manager
#[derive(Default)]
pub struct MemDataManager {
    datastores: DashMap<String, Arc<Datastore>>,
}

impl MemDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn datastore(&self, datastore: &str) -> Result<Arc<Datastore>> {
        self.datastores
            .get(datastore)
            .map(|d| Arc::clone(&d))
            .ok_or_else(|| {
                Error::operation(
                    ErrorCode::DatastoreNotFound,
                    format!("datastore {} does not exist", datastore),
                )
            })
    }

    fn collection(&self, datastore: &str, collection: &str) -> Result<Arc<Collection>> {
        self.datastore(datastore)?
            .collections
            .get(collection)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| {
                Error::operation(
                    ErrorCode::CollectionNotFound,
                    format!("collection {}.{} does not exist", datastore, collection),
                )
            })
    }
}

impl DataManager for MemDataManager {
    fn create_datastore(&self, datastore: &str) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.datastores.entry(datastore.to_string()) {
            Entry::Occupied(_) => Err(Error::operation(
                ErrorCode::DatastoreExists,
                format!("datastore {} already exists", datastore),
            )),
            Entry::Vacant(v) => {
                v.insert(Arc::new(Datastore::default()));
                Ok(())
            }
        }
    }

    fn drop_datastore(&self, datastore: &str) -> Result<()> {
        self.datastores.remove(datastore).map(|_| ()).ok_or_else(|| {
            Error::operation(
                ErrorCode::DatastoreNotFound,
                format!("datastore {} does not exist", datastore),
            )
        })
    }

    fn datastore_exists(&self, datastore: &str) -> bool {
        self.datastores.contains_key(datastore)
    }

    fn list_datastores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datastores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn create_collection(&self, datastore: &str, collection: &str, schema: &Value) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        let ds = self.datastore(datastore)?;
        let result = match ds.collections.entry(collection.to_string()) {
            Entry::Occupied(_) => Err(Error::operation(
                ErrorCode::CollectionExists,
                format!("collection {}.{} already exists", datastore, collection),
            )),
            Entry::Vacant(v) => {
                v.insert(Arc::new(Collection {
                    schema: schema.clone(),
                    rows: DashMap::new(),
                }));
                Ok(())
            }
        };
        result
    }

    fn drop_collection(&self, datastore: &str, collection: &str) -> Result<()> {
        self.datastore(datastore)?
            .collections
            .remove(collection)
            .map(|_| ())
            .ok_or_else(|| {
                Error::operation(
                    ErrorCode::CollectionNotFound,
                    format!("collection {}.{} does not exist", datastore, collection),
                )
            })
    }

    fn collection_exists(&self, datastore: &str, collection: &str) -> bool {
        self.collection(datastore, collection).is_ok()
    }

    fn list_collections(&self, datastore: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .datastore(datastore)?
            .collections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn collection_schema(&self, datastore: &str, collection: &str) -> Result<Value> {
        Ok(self.collection(datastore, collection)?.schema.clone())
    }

    fn insert(&self, datastore: &str, collection: &str, key: &str, data: Value) -> Result<()> {
        self.collection(datastore, collection)?
            .rows
            .insert(key.to_string(), data);
        Ok(())
    }

    fn select(&self, datastore: &str, collection: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .collection(datastore, collection)?
            .rows
            .get(key)
            .map(|r| r.value().clone()))
    }

    fn remove(&self, datastore: &str, collection: &str, key: &str) -> Result<()> {
        self.collection(datastore, collection)?.rows.remove(key);
        Ok(())
    }

    fn select_all_keys(&self, datastore: &str, collection: &str) -> Result<Vec<String>> {
        Ok(self
            .collection(datastore, collection)?
            .rows
            .iter()
            .map(|r| r.key().clone())
            .collect())
    }

    fn select_keys_with_pattern(
        &self,
        datastore: &str,
        collection: &str,
        column: &str,
        value: &Value,
        op: Operator,
    ) -> Result<Vec<String>> {
        Ok(self
            .collection(datastore, collection)?
            .rows
            .iter()
            .filter(|r| {
                r.value()
                    .get(column)
                    .map(|field| op.matches(field, value))
                    .unwrap_or(false)
            })
            .map(|r| r.key().clone())
            .collect())
    }
}

/// In-memory system catalog
#[derive(Default)]
pub struct MemSystemCatalog {
    users: DashMap<String, Value>,
    procedures: DashMap<String, Value>,
    artifacts: DashMap<String, Vec<u8>>,
}

impl MemSystemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, name: &str, row: Value) {
        self.users.insert(name.to_string(), row);
    }

    pub fn add_procedure(&self, artifact: ProcedureArtifact, registry_row: Value) {
        self.procedures.insert(artifact.name.clone(), registry_row);
        self.artifacts.insert(artifact.name, artifact.bytes);
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn has_artifact(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }
}

fn row_name(row: &Value) -> Result<String> {
    row.get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::operation(
                ErrorCode::InvalidArgument,
                "system table row has no \"name\" field",
            )
        })
}

impl SystemCatalog for MemSystemCatalog {
    fn export_tables(&self) -> Result<SystemTables> {
        Ok(SystemTables {
            users: self.users.iter().map(|r| r.value().clone()).collect(),
            procedures: self.procedures.iter().map(|r| r.value().clone()).collect(),
        })
    }

    fn import_tables(&self, tables: SystemTables) -> Result<()> {
        for row in tables.users {
            self.users.insert(row_name(&row)?, row);
        }
        for row in tables.procedures {
            self.procedures.insert(row_name(&row)?, row);
        }
        Ok(())
    }

    fn export_procedures(&self) -> Result<Vec<ProcedureArtifact>> {
        Ok(self
            .artifacts
            .iter()
            .map(|a| ProcedureArtifact {
                name: a.key().clone(),
                bytes: a.value().clone(),
            })
            .collect())
    }

    fn load_procedures(&self, procedures: Vec<ProcedureArtifact>) -> Result<()> {
        for artifact in procedures {
            if artifact.bytes.is_empty() {
                return Err(Error::operation(
                    ErrorCode::InvalidArgument,
                    format!("procedure artifact {} is empty", artifact.name),
                ));
            }
            self.artifacts.insert(artifact.name, artifact.bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_datastore_lifecycle() {
        let dm = MemDataManager::new();
        dm.create_datastore("sales").unwrap();
        let err = dm.create_datastore("sales").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DatastoreExists));

        dm.create_collection("sales", "orders", &json!({"pk": "id"}))
            .unwrap();
        assert_eq!(dm.list_collections("sales").unwrap(), vec!["orders"]);
        assert_eq!(
            dm.collection_schema("sales", "orders").unwrap(),
            json!({"pk": "id"})
        );

        dm.drop_datastore("sales").unwrap();
        assert!(!dm.datastore_exists("sales"));
        assert!(dm.list_collections("sales").is_err());
    }

    #[test]
    fn test_pattern_lookup() {
        let dm = MemDataManager::new();
        dm.create_datastore("ds").unwrap();
        dm.create_collection("ds", "c", &Value::Null).unwrap();
        dm.insert("ds", "c", "k1", json!({"age": 20})).unwrap();
        dm.insert("ds", "c", "k2", json!({"age": 40})).unwrap();
        dm.insert("ds", "c", "k3", json!({"name": "x"})).unwrap();

        let mut keys = dm
            .select_keys_with_pattern("ds", "c", "age", &json!(30), Operator::Gt)
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k2"]);

        let keys = dm
            .select_keys_with_pattern("ds", "c", "age", &json!(20), Operator::Eq)
            .unwrap();
        assert_eq!(keys, vec!["k1"]);
    }

    #[test]
    fn test_system_catalog_roundtrip() {
        let source = MemSystemCatalog::new();
        source.add_user("root", json!({"name": "root"}));
        source.add_procedure(
            ProcedureArtifact {
                name: "sp.jar".into(),
                bytes: vec![1, 2, 3],
            },
            json!({"name": "sp.jar"}),
        );

        let target = MemSystemCatalog::new();
        target.import_tables(source.export_tables().unwrap()).unwrap();
        target
            .load_procedures(source.export_procedures().unwrap())
            .unwrap();
        assert_eq!(target.user_count(), 1);
        assert!(target.has_artifact("sp.jar"));
    }
}
