//! Participant-side local execution of one distributed operation
//!
//! A processor soft-commits (tentatively applies) its operation, then is
//! either committed or rolled back exactly once. `commit` and `rollback`
//! consume the processor, so a finalized processor cannot be touched again.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::common::{validate_name, Error, ErrorCode, Result};
use crate::protocol::{QueryBody, Record, Response};
use crate::storage::DataManager;

pub trait Processor: Send + Sync {
    /// Tentatively apply the operation.
    fn soft_commit(&mut self) -> Result<Response>;

    /// Make the tentative apply durable.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Undo the tentative apply.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Build the local processor for a participant-side operation.
pub fn processor_for(body: &QueryBody, data: Arc<dyn DataManager>) -> Option<Box<dyn Processor>> {
    let processor: Box<dyn Processor> = match body {
        QueryBody::CreateDatastore { datastore } => Box::new(CreateDatastoreProcessor {
            data,
            datastore: datastore.clone(),
            created: false,
        }),
        QueryBody::DropDatastore { datastore } => Box::new(DropDatastoreProcessor {
            data,
            datastore: datastore.clone(),
        }),
        QueryBody::ListDatastores => Box::new(ListDatastoresProcessor { data }),
        QueryBody::CreateCollection {
            datastore,
            collection,
            schema,
        } => Box::new(CreateCollectionProcessor {
            data,
            datastore: datastore.clone(),
            collection: collection.clone(),
            schema: schema.clone(),
            created: false,
        }),
        QueryBody::DropCollection {
            datastore,
            collection,
        } => Box::new(DropCollectionProcessor {
            data,
            datastore: datastore.clone(),
            collection: collection.clone(),
        }),
        QueryBody::ListCollections { datastore } => Box::new(ListCollectionsProcessor {
            data,
            datastore: datastore.clone(),
        }),
        QueryBody::Insert {
            datastore,
            collection,
            records,
        } => Box::new(InsertProcessor {
            data,
            datastore: datastore.clone(),
            collection: collection.clone(),
            records: records.clone(),
            applied: Vec::new(),
        }),
        _ => return None,
    };
    Some(processor)
}

// === Datastores ===

struct CreateDatastoreProcessor {
    data: Arc<dyn DataManager>,
    datastore: String,
    created: bool,
}

impl Processor for CreateDatastoreProcessor {
    fn soft_commit(&mut self) -> Result<Response> {
        validate_name("datastore", &self.datastore)?;
        self.data.create_datastore(&self.datastore)?;
        self.created = true;
        Ok(Response::ok())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        debug!("Datastore {} committed", self.datastore);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        if self.created {
            self.data.drop_datastore(&self.datastore)?;
        }
        Ok(())
    }
}

/// Drop is validated on soft commit and applied on commit.
struct DropDatastoreProcessor {
    data: Arc<dyn DataManager>,
    datastore: String,
}

impl Processor for DropDatastoreProcessor {
    fn soft_commit(&mut self) -> Result<Response> {
        if !self.data.datastore_exists(&self.datastore) {
            return Err(Error::operation(
                ErrorCode::DatastoreNotFound,
                format!("datastore {} does not exist", self.datastore),
            ));
        }
        Ok(Response::ok())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.data.drop_datastore(&self.datastore)
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct ListDatastoresProcessor {
    data: Arc<dyn DataManager>,
}

impl Processor for ListDatastoresProcessor {
    fn soft_commit(&mut self) -> Result<Response> {
        Ok(Response::with_data(Value::from(self.data.list_datastores())))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// === Collections ===

struct CreateCollectionProcessor {
    data: Arc<dyn DataManager>,
    datastore: String,
    collection: String,
    schema: Value,
    created: bool,
}

impl Processor for CreateCollectionProcessor {
    fn soft_commit(&mut self) -> Result<Response> {
        validate_name("collection", &self.collection)?;
        self.data
            .create_collection(&self.datastore, &self.collection, &self.schema)?;
        self.created = true;
        Ok(Response::ok())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        if self.created {
            self.data.drop_collection(&self.datastore, &self.collection)?;
        }
        Ok(())
    }
}

struct DropCollectionProcessor {
    data: Arc<dyn DataManager>,
    datastore: String,
    collection: String,
}

impl Processor for DropCollectionProcessor {
    fn soft_commit(&mut self) -> Result<Response> {
        if !self.data.collection_exists(&self.datastore, &self.collection) {
            return Err(Error::operation(
                ErrorCode::CollectionNotFound,
                format!(
                    "collection {}.{} does not exist",
                    self.datastore, self.collection
                ),
            ));
        }
        Ok(Response::ok())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.data.drop_collection(&self.datastore, &self.collection)
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct ListCollectionsProcessor {
    data: Arc<dyn DataManager>,
    datastore: String,
}

impl Processor for ListCollectionsProcessor {
    fn soft_commit(&mut self) -> Result<Response> {
        let names = self.data.list_collections(&self.datastore)?;
        Ok(Response::with_data(Value::from(names)))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// === Records ===

struct InsertProcessor {
    data: Arc<dyn DataManager>,
    datastore: String,
    collection: String,
    records: Vec<Record>,
    /// Keys written so far with the value each one replaced.
    applied: Vec<(String, Option<Value>)>,
}

impl Processor for InsertProcessor {
    fn soft_commit(&mut self) -> Result<Response> {
        for record in &self.records {
            let previous = self
                .data
                .select(&self.datastore, &self.collection, &record.key)?;
            self.data.insert(
                &self.datastore,
                &self.collection,
                &record.key,
                record.data.clone(),
            )?;
            self.applied.push((record.key.clone(), previous));
        }
        Ok(Response::with_rows(self.applied.len() as u64))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        debug!(
            "Committed {} records into {}.{}",
            self.applied.len(),
            self.datastore,
            self.collection
        );
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        for (key, previous) in self.applied.into_iter().rev() {
            let result = match previous {
                Some(value) => self.data.insert(&self.datastore, &self.collection, &key, value),
                None => self.data.remove(&self.datastore, &self.collection, &key),
            };
            if let Err(e) = result {
                warn!(
                    "Failed to undo insert of {} in {}.{}: {}",
                    key, self.datastore, self.collection, e
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemDataManager;
    use serde_json::json;

    fn dm() -> Arc<MemDataManager> {
        Arc::new(MemDataManager::new())
    }

    #[test]
    fn test_create_datastore_rollback() {
        let data = dm();
        let body = QueryBody::CreateDatastore {
            datastore: "sales".into(),
        };
        let mut p = processor_for(&body, data.clone()).unwrap();
        p.soft_commit().unwrap();
        assert!(data.datastore_exists("sales"));
        p.rollback().unwrap();
        assert!(!data.datastore_exists("sales"));
    }

    #[test]
    fn test_failed_create_does_not_undo_existing() {
        let data = dm();
        data.create_datastore("sales").unwrap();
        let body = QueryBody::CreateDatastore {
            datastore: "sales".into(),
        };
        let mut p = processor_for(&body, data.clone()).unwrap();
        let err = p.soft_commit().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DatastoreExists));
        p.rollback().unwrap();
        assert!(data.datastore_exists("sales"));
    }

    #[test]
    fn test_drop_applies_on_commit() {
        let data = dm();
        data.create_datastore("old").unwrap();
        let body = QueryBody::DropDatastore {
            datastore: "old".into(),
        };
        let mut p = processor_for(&body, data.clone()).unwrap();
        p.soft_commit().unwrap();
        assert!(data.datastore_exists("old"));
        p.commit().unwrap();
        assert!(!data.datastore_exists("old"));
    }

    #[test]
    fn test_insert_rollback_restores_previous() {
        let data = dm();
        data.create_datastore("ds").unwrap();
        data.create_collection("ds", "c", &Value::Null).unwrap();
        data.insert("ds", "c", "k1", json!({"v": 1})).unwrap();

        let body = QueryBody::Insert {
            datastore: "ds".into(),
            collection: "c".into(),
            records: vec![
                Record {
                    key: "k1".into(),
                    data: json!({"v": 2}),
                },
                Record {
                    key: "k2".into(),
                    data: json!({"v": 3}),
                },
            ],
        };
        let mut p = processor_for(&body, data.clone()).unwrap();
        assert_eq!(p.soft_commit().unwrap().rows, Some(2));
        assert_eq!(data.select("ds", "c", "k1").unwrap(), Some(json!({"v": 2})));

        p.rollback().unwrap();
        assert_eq!(data.select("ds", "c", "k1").unwrap(), Some(json!({"v": 1})));
        assert_eq!(data.select("ds", "c", "k2").unwrap(), None);
    }

    #[test]
    fn test_list_and_unsupported() {
        let data = dm();
        data.create_datastore("a").unwrap();
        let mut p = processor_for(&QueryBody::ListDatastores, data.clone()).unwrap();
        assert_eq!(p.soft_commit().unwrap().data, Some(json!(["a"])));
        assert!(processor_for(&QueryBody::Commit, data).is_none());
    }
}
