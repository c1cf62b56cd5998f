//! Membership store behaviour over a persisted config store

use nodemesh::cluster::{
    ClusterStore, ConfigStore, LoadReporter, MemConfigStore, Member, NodeId, SledConfigStore,
};
use nodemesh::ErrorCode;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;

fn store_with(members: &[&str]) -> ClusterStore {
    let store = ClusterStore::open(Arc::new(MemConfigStore::new()));
    store.create_cluster().unwrap();
    for m in members {
        store.notify_add_node(&NodeId::new(*m));
    }
    store
}

#[test]
fn test_identity_and_membership_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node-config");

    let (self_id, cluster_id) = {
        let config: Arc<dyn ConfigStore> = Arc::new(SledConfigStore::open(&path).unwrap());
        let store = ClusterStore::open(config);
        let cluster_id = store.create_cluster().unwrap();
        store.notify_add_node(&NodeId::new("peer-1"));
        (store.self_id().clone(), cluster_id)
    };

    let config: Arc<dyn ConfigStore> = Arc::new(SledConfigStore::open(&path).unwrap());
    let store = ClusterStore::open(config);
    assert_eq!(store.self_id(), &self_id);
    assert_eq!(store.cluster_id(), Some(cluster_id));
    assert!(store.has_node(&NodeId::new("peer-1")));
    assert_eq!(store.all_nodes().len(), 2);
}

#[test]
fn test_create_cluster_twice() {
    let store = ClusterStore::open(Arc::new(MemConfigStore::new()));
    let id = store.create_cluster().unwrap();
    let err = store.create_cluster().unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::AlreadyACluster));
    assert_eq!(store.cluster_id(), Some(id));
}

#[test]
fn test_add_remove_idempotent() {
    let store = store_with(&[]);
    let peer = NodeId::new("peer");

    store.notify_add_node(&peer);
    let once = store.all_nodes();
    store.notify_add_node(&peer);
    assert_eq!(store.all_nodes(), once);

    store.notify_remove_node(&peer);
    let removed = store.all_nodes();
    store.notify_remove_node(&peer);
    assert_eq!(store.all_nodes(), removed);
    assert_eq!(removed, vec![store.self_id().clone()]);
}

#[test]
fn test_least_loaded_full_and_local() {
    let store = store_with(&["b", "c", "d"]);
    let all: HashSet<NodeId> = store.all_nodes().into_iter().collect();

    assert_eq!(store.get_least_loaded_nodes(-1).unwrap(), all);
    assert_eq!(
        store.get_least_loaded_nodes(0).unwrap(),
        HashSet::from([store.self_id().clone()])
    );
    for rf in 1..=6 {
        let picked = store.get_least_loaded_nodes(rf).unwrap();
        assert!(picked.len() <= rf as usize);
        assert!(picked.is_subset(&all));
    }
    assert_eq!(
        store.get_least_loaded_nodes(-3).unwrap_err().code(),
        Some(ErrorCode::InvalidArgument)
    );
}

#[test]
fn test_single_member_always_self() {
    let store = ClusterStore::open(Arc::new(MemConfigStore::new()));
    let only = HashSet::from([store.self_id().clone()]);
    for rf in [-1, 0, 1, 3] {
        assert_eq!(store.get_least_loaded_nodes(rf).unwrap(), only);
    }
}

struct FixedLoad(HashMap<NodeId, u64>);

impl LoadReporter for FixedLoad {
    fn load(&self, node: &NodeId) -> Option<u64> {
        self.0.get(node).copied()
    }
}

#[test]
fn test_least_loaded_prefers_low_load() {
    let load = FixedLoad(HashMap::from([
        (NodeId::new("b"), 10),
        (NodeId::new("c"), 3),
        (NodeId::new("d"), 50),
    ]));
    let store = ClusterStore::open(Arc::new(MemConfigStore::new())).with_load_reporter(Arc::new(load));
    store.create_cluster().unwrap();
    for m in ["b", "c", "d"] {
        store.notify_add_node(&NodeId::new(m));
    }

    assert_eq!(
        store.get_least_loaded_nodes(2).unwrap(),
        HashSet::from([NodeId::new("c"), NodeId::new("b")])
    );
}

#[test]
fn test_join_cluster_adopts_members() {
    let store = ClusterStore::open(Arc::new(MemConfigStore::new()));
    store
        .join_cluster(
            "cluster-1",
            &[
                Member {
                    node_id: NodeId::new("a"),
                    address: Some("10.0.0.1:10113".into()),
                },
                Member {
                    node_id: NodeId::new("b"),
                    address: None,
                },
            ],
        )
        .unwrap();
    assert!(store.is_clustered());
    assert_eq!(store.all_nodes().len(), 3);
    assert_eq!(store.address(&NodeId::new("a")).as_deref(), Some("10.0.0.1:10113"));
}
