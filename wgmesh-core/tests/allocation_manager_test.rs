//! Integration tests for the allocation manager's restore and steady-state
//! behavior over the in-memory node store.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use common::{init_tracing, node, node_with_mesh, test_config, ConflictingStore};
use wgmesh_core::error::MeshError;
use wgmesh_core::manager::{AllocationManager, Phase};
use wgmesh_core::store::{MemoryNodeStore, NodeStore};
use wgmesh_core::watcher::{AllocationService, NodeEvent};

fn create_manager(subnet: &str) -> (Arc<MemoryNodeStore>, AllocationManager) {
    let store = Arc::new(MemoryNodeStore::new());
    let manager = AllocationManager::new(&test_config(subnet), store.clone()).unwrap();
    (store, manager)
}

#[tokio::test]
async fn test_restore_and_resync_scenario() {
    init_tracing();
    let (store, manager) = create_manager("10.0.0.0/24");

    // n1 has no recorded address yet, n2 kept 10.0.0.5 from a prior run.
    store.put(node("n1")).await;
    store.put(node_with_mesh("n2", "10.0.0.5")).await;

    manager.node_added(&node("n1")).await.unwrap();
    manager
        .node_added(&node_with_mesh("n2", "10.0.0.5"))
        .await
        .unwrap();

    assert_eq!(manager.phase().await, Phase::Restoring);
    assert_eq!(manager.pending_nodes().await, vec!["n1".to_string()]);
    assert_eq!(manager.stats().await.allocated, 1);

    manager.resync().await.unwrap();

    assert_eq!(manager.phase().await, Phase::SteadyState);
    assert!(manager.pending_nodes().await.is_empty());

    // n1 got the lowest free address, skipping nothing below the re-reserved
    // 10.0.0.5.
    let n1 = store.get("n1").await.unwrap();
    assert_eq!(n1.mesh_ipv4(), Some("10.0.0.1".parse().unwrap()));

    // Deleting n2 frees 10.0.0.5 for re-reservation.
    manager
        .node_deleted(&node_with_mesh("n2", "10.0.0.5"))
        .await
        .unwrap();
    manager
        .node_added(&node_with_mesh("n3", "10.0.0.5"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_no_two_nodes_share_an_address() {
    init_tracing();
    let (store, manager) = create_manager("10.0.0.0/28");
    manager.resync().await.unwrap();

    for i in 0..10 {
        let name = format!("node-{}", i);
        store.put(node(&name)).await;
        manager.node_added(&node(&name)).await.unwrap();
    }

    let mut seen = std::collections::BTreeSet::new();
    for stored in store.list().await {
        let ip = stored.mesh_ipv4().expect("every node got an address");
        assert!(seen.insert(ip), "address {} assigned twice", ip);
    }
    assert_eq!(seen.len(), 10);
}

#[tokio::test]
async fn test_restore_does_not_touch_the_pool() {
    init_tracing();
    let (_, manager) = create_manager("10.0.0.0/24");

    manager.node_added(&node("n1")).await.unwrap();
    manager.node_updated(&node("n1")).await.unwrap();

    let stats = manager.stats().await;
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.pending_restore, 1);
}

#[tokio::test]
async fn test_pool_exhaustion_surfaces_to_caller() {
    init_tracing();
    // 10.0.0.0/30 has two usable addresses.
    let (store, manager) = create_manager("10.0.0.0/30");
    manager.resync().await.unwrap();

    for name in ["n1", "n2"] {
        store.put(node(name)).await;
        manager.node_added(&node(name)).await.unwrap();
    }

    store.put(node("n3")).await;
    let err = manager.node_added(&node("n3")).await.unwrap_err();
    assert!(matches!(err, MeshError::ResourceExhausted { .. }));

    // Nothing was persisted for the failed node.
    assert_eq!(store.get("n3").await.unwrap().mesh_ipv4(), None);
}

#[tokio::test]
async fn test_persist_retries_through_conflicts() {
    init_tracing();
    let inner = Arc::new(MemoryNodeStore::new());
    let store = Arc::new(ConflictingStore::new(inner.clone(), 2));
    let manager = AllocationManager::new(&test_config("10.0.0.0/24"), store).unwrap();
    manager.resync().await.unwrap();

    inner.put(node("n1")).await;
    manager.node_added(&node("n1")).await.unwrap();

    let stored = inner.get("n1").await.unwrap();
    assert_eq!(stored.mesh_ipv4(), Some("10.0.0.1".parse().unwrap()));
    let mesh_entries = stored
        .addresses
        .iter()
        .filter(|a| a.kind == wgmesh_core::types::AddressKind::Mesh)
        .count();
    assert_eq!(mesh_entries, 1);
}

#[tokio::test]
async fn test_persist_retry_exhaustion_leaves_pool_allocated() {
    init_tracing();
    let inner = Arc::new(MemoryNodeStore::new());
    // More conflicts than the configured three attempts.
    let store = Arc::new(ConflictingStore::new(inner.clone(), 5));
    let manager = AllocationManager::new(&test_config("10.0.0.0/24"), store).unwrap();
    manager.resync().await.unwrap();

    inner.put(node("n1")).await;
    let err = manager.node_added(&node("n1")).await.unwrap_err();
    assert!(err.is_conflict());

    // The documented gap: the address stays allocated even though the node
    // object was never updated.
    assert_eq!(manager.stats().await.allocated, 1);
    assert_eq!(inner.get("n1").await.unwrap().mesh_ipv4(), None);
}

#[tokio::test]
async fn test_partial_resync_resumes_with_remainder() {
    init_tracing();
    let (store, manager) = create_manager("10.0.0.0/24");

    // n1 is pending but missing from the store, so its persist fails and
    // aborts the drain before n2 is processed.
    store.put(node("n2")).await;
    manager.node_added(&node("n1")).await.unwrap();
    manager.node_added(&node("n2")).await.unwrap();

    let err = manager.resync().await.unwrap_err();
    assert!(matches!(err, MeshError::NotFound { .. }));

    assert_eq!(manager.phase().await, Phase::SteadyState);
    assert_eq!(
        manager.pending_nodes().await,
        vec!["n1".to_string(), "n2".to_string()]
    );

    // Once the missing object shows up, a second resync drains the rest.
    store.put(node("n1")).await;
    manager.resync().await.unwrap();

    assert!(manager.pending_nodes().await.is_empty());
    assert!(store.get("n1").await.unwrap().mesh_ipv4().is_some());
    assert!(store.get("n2").await.unwrap().mesh_ipv4().is_some());
}

#[tokio::test]
async fn test_resync_is_safe_to_repeat() {
    init_tracing();
    let (store, manager) = create_manager("10.0.0.0/24");

    store.put(node("n1")).await;
    manager.node_added(&node("n1")).await.unwrap();

    manager.resync().await.unwrap();
    let assigned = store.get("n1").await.unwrap().mesh_ipv4().unwrap();

    manager.resync().await.unwrap();

    // The second call neither reassigns nor double-allocates.
    assert_eq!(store.get("n1").await.unwrap().mesh_ipv4(), Some(assigned));
    assert_eq!(manager.stats().await.allocated, 1);
}

#[tokio::test]
async fn test_delete_before_resync_is_never_a_quiet_noop() {
    init_tracing();
    let (_, manager) = create_manager("10.0.0.0/24");

    let err = manager.node_deleted(&node("n1")).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, MeshError::InvariantViolation { .. }));
}

#[tokio::test]
async fn test_release_of_unknown_address_is_an_error() {
    init_tracing();
    let (_, manager) = create_manager("10.0.0.0/24");
    manager.resync().await.unwrap();

    // The node object claims an address the pool never handed out and never
    // re-reserved; releasing it must not be silently ignored.
    let err = manager
        .node_deleted(&node_with_mesh("n1", "10.0.0.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::InvalidOperation { .. }));
}

#[tokio::test]
async fn test_full_lifecycle_through_event_service() {
    init_tracing();
    let (store, manager) = create_manager("10.0.0.0/24");
    let manager = Arc::new(manager);
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(AllocationService::new(manager.clone(), rx).run());

    let n1 = store.put(node("n1")).await;
    let n2 = store.put(node_with_mesh("n2", "10.0.0.5")).await;

    tx.send(NodeEvent::Added { node: n1 }).await.unwrap();
    tx.send(NodeEvent::Added { node: n2.clone() }).await.unwrap();
    tx.send(NodeEvent::Resync).await.unwrap();
    tx.send(NodeEvent::Deleted { node: n2 }).await.unwrap();
    drop(tx);

    handle.await.unwrap().unwrap();

    assert_eq!(
        store.get("n1").await.unwrap().mesh_ipv4(),
        Some("10.0.0.1".parse().unwrap())
    );
    // n2's address went back to the pool.
    assert_eq!(manager.stats().await.allocated, 1);
}
