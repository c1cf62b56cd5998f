//! Best-effort bulk delete against a storage layer that fails some keys

use nodemesh::bulk::{BulkDelete, DeleteStatement, Predicate};
use nodemesh::storage::{DataManager, MemDataManager, Operator};
use nodemesh::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Delegates to an in-memory store but refuses to remove selected keys.
struct Flaky {
    inner: MemDataManager,
    stuck: HashSet<String>,
}

impl DataManager for Flaky {
    fn create_datastore(&self, datastore: &str) -> Result<()> {
        self.inner.create_datastore(datastore)
    }
    fn drop_datastore(&self, datastore: &str) -> Result<()> {
        self.inner.drop_datastore(datastore)
    }
    fn datastore_exists(&self, datastore: &str) -> bool {
        self.inner.datastore_exists(datastore)
    }
    fn list_datastores(&self) -> Vec<String> {
        self.inner.list_datastores()
    }
    fn create_collection(&self, datastore: &str, collection: &str, schema: &Value) -> Result<()> {
        self.inner.create_collection(datastore, collection, schema)
    }
    fn drop_collection(&self, datastore: &str, collection: &str) -> Result<()> {
        self.inner.drop_collection(datastore, collection)
    }
    fn collection_exists(&self, datastore: &str, collection: &str) -> bool {
        self.inner.collection_exists(datastore, collection)
    }
    fn list_collections(&self, datastore: &str) -> Result<Vec<String>> {
        self.inner.list_collections(datastore)
    }
    fn collection_schema(&self, datastore: &str, collection: &str) -> Result<Value> {
        self.inner.collection_schema(datastore, collection)
    }
    fn insert(&self, datastore: &str, collection: &str, key: &str, data: Value) -> Result<()> {
        self.inner.insert(datastore, collection, key, data)
    }
    fn select(&self, datastore: &str, collection: &str, key: &str) -> Result<Option<Value>> {
        self.inner.select(datastore, collection, key)
    }
    fn remove(&self, datastore: &str, collection: &str, key: &str) -> Result<()> {
        if self.stuck.contains(key) {
            return Err(Error::Io(std::io::Error::other(format!("sector holding {} unreadable", key))));
        }
        self.inner.remove(datastore, collection, key)
    }
    fn select_all_keys(&self, datastore: &str, collection: &str) -> Result<Vec<String>> {
        self.inner.select_all_keys(datastore, collection)
    }
    fn select_keys_with_pattern(
        &self,
        datastore: &str,
        collection: &str,
        column: &str,
        value: &Value,
        op: Operator,
    ) -> Result<Vec<String>> {
        if value == &json!("broken") {
            return Err(Error::Internal("index unavailable".into()));
        }
        self.inner
            .select_keys_with_pattern(datastore, collection, column, value, op)
    }
}

fn flaky(rows: usize, stuck: &[&str]) -> Arc<Flaky> {
    let inner = MemDataManager::new();
    inner.create_datastore("ds").unwrap();
    inner.create_collection("ds", "events", &Value::Null).unwrap();
    for i in 0..rows {
        let kind = if i % 2 == 0 { "click" } else { "view" };
        inner
            .insert("ds", "events", &format!("e{}", i), json!({"n": i, "kind": kind}))
            .unwrap();
    }
    Arc::new(Flaky {
        inner,
        stuck: stuck.iter().map(|s| s.to_string()).collect(),
    })
}

fn delete(predicate: Option<Predicate>) -> DeleteStatement {
    DeleteStatement {
        datastore: "ds".into(),
        tables: vec!["events".into()],
        predicate,
    }
}

#[tokio::test]
async fn test_failures_do_not_abort_batch() {
    let data = flaky(20, &["e3", "e7", "e11"]);
    let bulk = BulkDelete::new(data.clone(), 4);

    let response = bulk.execute(&delete(None)).await.unwrap();
    assert_eq!(response.rows, Some(17));

    let mut left = data.select_all_keys("ds", "events").unwrap();
    left.sort();
    assert_eq!(left, vec!["e11", "e3", "e7"]);
}

#[tokio::test]
async fn test_filtered_delete_counts_successes() {
    let data = flaky(10, &["e4"]);
    let bulk = BulkDelete::new(data.clone(), 2);

    // clicks are even rows: e0 e2 e4 e6 e8, of which e4 fails
    let response = bulk
        .execute(&delete(Some(Predicate::compare("kind", "=", json!("click")))))
        .await
        .unwrap();
    assert_eq!(response.rows, Some(4));
    assert_eq!(data.select_all_keys("ds", "events").unwrap().len(), 6);
}

#[tokio::test]
async fn test_in_skips_failed_lookups() {
    let data = flaky(6, &[]);
    let bulk = BulkDelete::new(data.clone(), 2);

    let response = bulk
        .execute(&delete(Some(Predicate::is_in(
            "n",
            vec![json!(1), json!("broken"), json!(4)],
        ))))
        .await
        .unwrap();
    assert_eq!(response.rows, Some(2));
    assert!(data.select("ds", "events", "e1").unwrap().is_none());
    assert!(data.select("ds", "events", "e4").unwrap().is_none());

    // Outside IN a failed lookup fails the whole delete.
    let err = bulk
        .execute(&delete(Some(Predicate::compare("kind", "=", json!("broken")))))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert_eq!(data.select_all_keys("ds", "events").unwrap().len(), 4);
}

#[tokio::test]
async fn test_or_of_ranges() {
    let data = flaky(10, &[]);
    let bulk = BulkDelete::new(data.clone(), 3);
    let predicate = Predicate::or(
        Predicate::compare("n", "<", json!(2)),
        Predicate::and(
            Predicate::compare("n", ">=", json!(7)),
            Predicate::compare("kind", "<>", json!("view")),
        ),
    );
    // n in {0, 1} or (n >= 7 and even) = {0, 1, 8}
    let response = bulk.execute(&delete(Some(predicate))).await.unwrap();
    assert_eq!(response.rows, Some(3));
}
