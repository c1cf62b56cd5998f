//! Onboarding of new nodes into a running cluster

mod common;

use common::*;
use nodemesh::cluster::{Member, NodeStatus};
use nodemesh::protocol::{
    ProcedureArtifact, Query, QueryBody, QueryType, SystemTables,
};
use nodemesh::storage::{MemSystemCatalog, SystemCatalog};
use nodemesh::{Collaborators, Error, NodeConfig, Result};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn ids(node: &nodemesh::ClusterNode) -> HashSet<String> {
    node.cluster()
        .all_nodes()
        .into_iter()
        .map(|n| n.to_string())
        .collect()
}

#[tokio::test]
async fn test_new_node_joins_two_node_cluster() {
    let catalog_a = Arc::new(MemSystemCatalog::new());
    catalog_a.add_user("admin", json!({"name": "admin", "role": "root"}));
    catalog_a.add_procedure(
        ProcedureArtifact {
            name: "triggers.jar".into(),
            bytes: vec![0xca, 0xfe, 0xba, 0xbe],
        },
        json!({"name": "triggers.jar", "kind": "trigger"}),
    );
    let a = start_node_with(
        test_config(),
        Collaborators {
            catalog: catalog_a,
            ..Default::default()
        },
    )
    .await;
    let b = start_node().await;
    let catalog_n = Arc::new(MemSystemCatalog::new());
    let n = start_node_with(
        test_config(),
        Collaborators {
            catalog: catalog_n.clone(),
            ..Default::default()
        },
    )
    .await;

    a.manager().create_cluster().unwrap();
    within(a.manager().add_node(&b.advertised_addr()))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || b.cluster().self_status() == NodeStatus::Connected).await);

    within(a.transactions().create_datastore("sales")).await.unwrap();
    within(a.transactions().create_collection("sales", "orders", json!({"id": "string"})))
        .await
        .unwrap();

    let joined = within(a.manager().add_node(&n.advertised_addr()))
        .await
        .unwrap();
    assert_eq!(&joined, n.self_id());

    let expected: HashSet<String> = [a.self_id(), b.self_id(), n.self_id()]
        .iter()
        .map(|id| id.to_string())
        .collect();
    assert!(
        wait_until(Duration::from_secs(5), || {
            n.cluster().self_status() == NodeStatus::Connected
                && ids(&a) == expected
                && ids(&b) == expected
                && ids(&n) == expected
        })
        .await,
        "membership did not converge: a={:?} b={:?} n={:?}",
        ids(&a),
        ids(&b),
        ids(&n)
    );

    assert_eq!(n.cluster().cluster_id(), a.cluster().cluster_id());
    assert_eq!(a.cluster().node_status(n.self_id()), Some(NodeStatus::Connected));
    assert!(wait_until(Duration::from_secs(5), || {
        b.cluster().node_status(n.self_id()) == Some(NodeStatus::Connected)
    })
    .await);
    assert!(n.registry().is_connected(a.self_id()));
    assert!(n.registry().is_connected(b.self_id()));

    // Replicated state
    assert!(n.data().collection_exists("sales", "orders"));
    assert_eq!(catalog_n.user_count(), 1);
    assert!(catalog_n.has_artifact("triggers.jar"));

    // The new member takes part in transactions
    within(n.transactions().create_datastore("inventory")).await.unwrap();
    for node in [&a, &b, &n] {
        assert!(node.data().datastore_exists("inventory"));
    }

    n.shutdown().await;
    b.shutdown().await;
    a.shutdown().await;
}

/// A catalog whose table import always fails.
struct BrokenCatalog;

impl SystemCatalog for BrokenCatalog {
    fn export_tables(&self) -> Result<SystemTables> {
        Ok(SystemTables::default())
    }
    fn import_tables(&self, _tables: SystemTables) -> Result<()> {
        Err(Error::Internal("system table store is read-only".into()))
    }
    fn export_procedures(&self) -> Result<Vec<ProcedureArtifact>> {
        Ok(Vec::new())
    }
    fn load_procedures(&self, _procedures: Vec<ProcedureArtifact>) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_phase_aborts_onboarding() {
    let a = start_node().await;
    let n = start_node_with(
        test_config(),
        Collaborators {
            catalog: Arc::new(BrokenCatalog),
            ..Default::default()
        },
    )
    .await;

    a.manager().create_cluster().unwrap();
    let err = within(a.manager().add_node(&n.advertised_addr()))
        .await
        .unwrap_err();
    match err {
        Error::OnboardingFailed { phase, cause, .. } => {
            assert_eq!(phase, "ONB3");
            assert!(cause.contains("read-only"), "cause: {}", cause);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert!(!a.cluster().has_node(n.self_id()));
    assert_eq!(a.cluster().node_status(n.self_id()), Some(NodeStatus::Down));
    assert!(!n.cluster().is_clustered());
    assert_ne!(n.cluster().self_status(), NodeStatus::Connected);
    assert!(wait_until(Duration::from_secs(2), || !a.registry().is_connected(n.self_id())).await);

    n.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_add_node_requires_cluster() {
    let a = start_node().await;
    let b = start_node().await;
    let err = a.manager().add_node(&b.advertised_addr()).await.unwrap_err();
    assert_eq!(err.code(), Some(nodemesh::ErrorCode::NotAMember));
    b.shutdown().await;
    a.shutdown().await;
}

/// Drive a joiner through ONB1..ONB5_2 by hand, acting as the coordinator.
async fn drive_to_syncing(peer: &mut FakePeer, session: &str) {
    let me = Member {
        node_id: peer.id.clone(),
        address: None,
    };
    let phases = vec![
        QueryBody::Onb1 {
            cluster_id: "cluster-x".into(),
            members: vec![me.clone()],
        },
        QueryBody::Onb2 { schemas: vec![] },
        QueryBody::Onb3 {
            tables: SystemTables::default(),
        },
        QueryBody::Onb4 { procedures: vec![] },
        QueryBody::Onb52 { members: vec![me] },
    ];
    for body in phases {
        let phase = body.query_type();
        peer.send(&Query::new(session, body)).await;
        let reply = peer.recv().await.expect("no ack");
        assert_eq!(reply.request_id, session);
        let ack = reply.body.onboarding_ack().expect("not an ack");
        assert!(ack.ok, "{} rejected: {:?}", phase, ack.cause);
    }
}

fn short_sync_config() -> NodeConfig {
    NodeConfig {
        sync_timeout_secs: 1,
        ..test_config()
    }
}

#[tokio::test]
async fn test_sync_timeout_marks_down_and_late_success_is_ignored() {
    let n = start_node_with(short_sync_config(), Collaborators::default()).await;
    let (mut coordinator, _) = FakePeer::connect(n.local_addr(), "coordinator").await;

    drive_to_syncing(&mut coordinator, "s1").await;
    assert_eq!(n.cluster().self_status(), NodeStatus::Syncing);

    assert!(wait_until(Duration::from_secs(3), || n.cluster().self_status() == NodeStatus::Down).await);

    coordinator
        .send(&Query::new(
            "s1",
            QueryBody::OnbSuccess {
                node_id: n.self_id().clone(),
                members: vec![],
            },
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(n.cluster().self_status(), NodeStatus::Down);
    assert!(!n.cluster().is_clustered());

    n.shutdown().await;
}

#[tokio::test]
async fn test_success_within_window_connects() {
    let n = start_node_with(short_sync_config(), Collaborators::default()).await;
    let (mut coordinator, _) = FakePeer::connect(n.local_addr(), "coordinator").await;

    drive_to_syncing(&mut coordinator, "s2").await;
    coordinator
        .send(&Query::new(
            "s2",
            QueryBody::OnbSuccess {
                node_id: n.self_id().clone(),
                members: vec![],
            },
        ))
        .await;

    assert!(wait_until(Duration::from_secs(2), || n.cluster().self_status() == NodeStatus::Connected).await);
    // Past the sync window the node stays connected.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(n.cluster().self_status(), NodeStatus::Connected);
    assert_eq!(n.cluster().cluster_id().as_deref(), Some("cluster-x"));
    assert!(n.cluster().has_node(&coordinator.id));

    n.shutdown().await;
}

#[tokio::test]
async fn test_phase_outside_session_is_rejected() {
    let n = start_node().await;
    let (mut coordinator, _) = FakePeer::connect(n.local_addr(), "coordinator").await;

    coordinator
        .send(&Query::new("nope", QueryBody::Onb2 { schemas: vec![] }))
        .await;
    let reply = coordinator.recv().await.unwrap();
    assert_eq!(reply.query_type(), QueryType::Onb2Ack);
    assert!(!reply.body.onboarding_ack().unwrap().ok);
    assert_eq!(n.cluster().self_status(), NodeStatus::Unknown);

    n.shutdown().await;
}

#[tokio::test]
async fn test_lost_connection_marks_member_down() {
    let a = start_node().await;
    let b = start_node().await;
    a.manager().create_cluster().unwrap();
    within(a.manager().add_node(&b.advertised_addr()))
        .await
        .unwrap();

    let b_id = b.self_id().clone();
    b.shutdown().await;
    assert!(wait_until(Duration::from_secs(3), || {
        a.cluster().node_status(&b_id) == Some(NodeStatus::Down)
    })
    .await);
    assert!(a.cluster().has_node(&b_id));

    a.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_silence_abandons_session() {
    let n = start_node_with(short_sync_config(), Collaborators::default()).await;
    let (mut coordinator, _) = FakePeer::connect(n.local_addr(), "coordinator").await;

    coordinator
        .send(&Query::new(
            "s3",
            QueryBody::Onb1 {
                cluster_id: "cluster-x".into(),
                members: vec![],
            },
        ))
        .await;
    assert!(coordinator.recv().await.unwrap().body.onboarding_ack().unwrap().ok);
    assert_eq!(n.cluster().self_status(), NodeStatus::NewNode);

    // No further phase arrives: the joiner falls back to standalone.
    assert!(wait_until(Duration::from_secs(3), || n.cluster().self_status() == NodeStatus::Unknown).await);
    coordinator
        .send(&Query::new("s3", QueryBody::Onb2 { schemas: vec![] }))
        .await;
    let reply = coordinator.recv().await.unwrap();
    assert!(!reply.body.onboarding_ack().unwrap().ok);
    assert!(!n.cluster().is_clustered());

    n.shutdown().await;
}

#[tokio::test]
async fn test_success_before_announce_keeps_member_connected() {
    let b = start_node().await;
    let joiner = start_node().await;
    let (mut coordinator, _) = FakePeer::connect(b.local_addr(), "coordinator").await;

    // ONB_SUCCESS overtakes ONB5_1 on another pooled connection.
    coordinator
        .send(&Query::new(
            "s4",
            QueryBody::OnbSuccess {
                node_id: joiner.self_id().clone(),
                members: vec![],
            },
        ))
        .await;
    coordinator
        .send(&Query::new(
            "s4",
            QueryBody::Onb51 {
                member: Member {
                    node_id: joiner.self_id().clone(),
                    address: Some(joiner.advertised_addr()),
                },
            },
        ))
        .await;
    let reply = coordinator.recv().await.unwrap();
    assert_eq!(reply.query_type(), QueryType::Onb51Ack);
    assert!(reply.body.onboarding_ack().unwrap().ok);

    assert!(b.cluster().has_node(joiner.self_id()));
    assert_eq!(b.cluster().node_status(joiner.self_id()), Some(NodeStatus::Connected));
    assert!(b.registry().is_connected(joiner.self_id()));

    joiner.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_success_member_list_adds_concurrent_joiner() {
    let n = start_node().await;
    let other = start_node().await;
    let (mut coordinator, _) = FakePeer::connect(n.local_addr(), "coordinator").await;

    // n's ONB5_2 snapshot predates `other` joining.
    drive_to_syncing(&mut coordinator, "s5").await;
    coordinator
        .send(&Query::new(
            "s5",
            QueryBody::OnbSuccess {
                node_id: n.self_id().clone(),
                members: vec![
                    Member {
                        node_id: coordinator.id.clone(),
                        address: None,
                    },
                    Member {
                        node_id: n.self_id().clone(),
                        address: Some(n.advertised_addr()),
                    },
                    Member {
                        node_id: other.self_id().clone(),
                        address: Some(other.advertised_addr()),
                    },
                ],
            },
        ))
        .await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            n.cluster().self_status() == NodeStatus::Connected
                && n.cluster().node_status(other.self_id()) == Some(NodeStatus::Connected)
        })
        .await
    );
    assert!(n.cluster().has_node(other.self_id()));
    assert!(n.cluster().has_node(&coordinator.id));
    assert!(n.registry().is_connected(other.self_id()));

    other.shutdown().await;
    n.shutdown().await;
}
