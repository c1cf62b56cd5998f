//! Persisted node configuration (self id, cluster id, operating mode, members)
//!
//! The cluster store only needs string key/value persistence. `SledConfigStore`
//! keeps it on disk; `MemConfigStore` is for tests and throwaway nodes.

use crate::common::Result;
use dashmap::DashMap;
use std::path::Path;

pub const KEY_SELF_NODE_ID: &str = "SELF_NODE_ID";
pub const KEY_CLUSTER_ID: &str = "CLUSTER_ID";
pub const KEY_OPERATING_MODE: &str = "OPERATING_MODE";
pub const KEY_CLUSTER_NODES: &str = "CLUSTER_NODES";

pub const MODE_CLUSTER: &str = "cluster";

/// Key/value persistence for node identity and cluster configuration.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory store (default for tests)
#[derive(Default)]
pub struct MemConfigStore {
    map: DashMap<String, String>,
}

impl MemConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemConfigStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.get(key).map(|v| v.clone()))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Sled-backed store
pub struct SledConfigStore {
    db: sled::Db,
}

impl SledConfigStore {
    /// Open or create the store under `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl ConfigStore for SledConfigStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                let value = String::from_utf8(bytes.to_vec()).map_err(|_| {
                    crate::Error::Internal(format!("config value for {} is not UTF-8", key))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mem_store() {
        let store = MemConfigStore::new();
        assert!(store.get(KEY_CLUSTER_ID).unwrap().is_none());
        store.put(KEY_CLUSTER_ID, "c-1").unwrap();
        assert_eq!(store.get(KEY_CLUSTER_ID).unwrap().as_deref(), Some("c-1"));
    }

    #[test]
    fn test_sled_store_persists() {
        let dir = tempdir().unwrap();
        {
            let store = SledConfigStore::open(dir.path().join("conf")).unwrap();
            store.put(KEY_SELF_NODE_ID, "node-a").unwrap();
        }
        let store = SledConfigStore::open(dir.path().join("conf")).unwrap();
        assert_eq!(
            store.get(KEY_SELF_NODE_ID).unwrap().as_deref(),
            Some("node-a")
        );
    }
}
