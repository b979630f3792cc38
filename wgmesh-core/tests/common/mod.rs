//! Shared helpers for wgmesh-core integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wgmesh_core::config::{MeshConfig, RetryConfig};
use wgmesh_core::error::{MeshError, MeshResult};
use wgmesh_core::store::{MemoryNodeStore, NodeStore};
use wgmesh_core::types::{NodeAddress, NodeObject};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("wgmesh_core=debug")
        .try_init();
}

pub fn test_config(subnet: &str) -> MeshConfig {
    MeshConfig {
        subnet: subnet.parse().unwrap(),
        reserved: Default::default(),
        persist_retry: RetryConfig {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        },
    }
}

pub fn node(name: &str) -> NodeObject {
    NodeObject::new(name)
}

pub fn node_with_mesh(name: &str, ip: &str) -> NodeObject {
    let mut node = NodeObject::new(name);
    node.addresses.push(NodeAddress::mesh(ip.parse().unwrap()));
    node
}

/// Store wrapper failing the next `conflicts` updates with a conflict error
/// before delegating to the inner store.
pub struct ConflictingStore {
    inner: Arc<MemoryNodeStore>,
    remaining: AtomicU32,
}

impl ConflictingStore {
    pub fn new(inner: Arc<MemoryNodeStore>, conflicts: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl NodeStore for ConflictingStore {
    async fn get(&self, name: &str) -> MeshResult<NodeObject> {
        self.inner.get(name).await
    }

    async fn update(&self, prev: Option<&NodeObject>, next: NodeObject) -> MeshResult<NodeObject> {
        let injected = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MeshError::Conflict {
                resource: format!("node {}", next.name),
            });
        }
        self.inner.update(prev, next).await
    }
}
