//! Access to cluster-wide node objects.
//!
//! The node objects are the only durable record of past allocation
//! decisions, so every write goes through optimistic concurrency: an update
//! based on a stale revision fails with [`MeshError::Conflict`] and the whole
//! fetch-mutate-write cycle is retried from a freshly fetched object.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{MeshError, MeshResult};
use crate::types::NodeObject;

/// Read-modify-write access to node objects.
///
/// When `prev` is supplied to `update`, its `resource_version` is the
/// revision the write is based on; otherwise the version carried by `next`
/// is used.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch a node object by name.
    async fn get(&self, name: &str) -> MeshResult<NodeObject>;

    /// Write back a node object, failing with [`MeshError::Conflict`] when
    /// the stored object changed since the revision the write is based on.
    async fn update(&self, prev: Option<&NodeObject>, next: NodeObject) -> MeshResult<NodeObject>;
}

/// Run a fetch-mutate-write closure, retrying only on conflict errors.
///
/// Attempts are bounded by `retry.max_attempts` with a fixed `retry.backoff`
/// between them; on exhaustion the final conflict error is returned. Any
/// other error aborts immediately.
pub async fn retry_on_conflict<T, F, Fut>(retry: &RetryConfig, mut op: F) -> MeshResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MeshResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_conflict() && attempt < retry.max_attempts => {
                debug!(attempt, "retrying node object update after conflict");
                tokio::time::sleep(retry.backoff).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// In-memory [`NodeStore`] with real optimistic-concurrency semantics.
///
/// Backs tests and the offline replay tool; a production deployment plugs a
/// client for the cluster object store into the same trait.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<String, NodeObject>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a node object, bumping its revision. Returns the
    /// stored copy.
    pub async fn put(&self, mut node: NodeObject) -> NodeObject {
        let mut nodes = self.nodes.write().await;
        let version = nodes
            .get(&node.name)
            .map(|current| current.resource_version)
            .unwrap_or(node.resource_version);
        node.resource_version = version + 1;
        nodes.insert(node.name.clone(), node.clone());
        node
    }

    /// Remove a node object, returning it if present.
    pub async fn remove(&self, name: &str) -> Option<NodeObject> {
        self.nodes.write().await.remove(name)
    }

    /// All stored node objects, in name order.
    pub async fn list(&self) -> Vec<NodeObject> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<NodeObject> = nodes.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get(&self, name: &str) -> MeshResult<NodeObject> {
        let nodes = self.nodes.read().await;
        nodes.get(name).cloned().ok_or_else(|| MeshError::NotFound {
            resource: format!("node {}", name),
        })
    }

    async fn update(&self, prev: Option<&NodeObject>, next: NodeObject) -> MeshResult<NodeObject> {
        let mut nodes = self.nodes.write().await;
        let current = nodes.get(&next.name).ok_or_else(|| MeshError::NotFound {
            resource: format!("node {}", next.name),
        })?;

        let base = prev
            .map(|p| p.resource_version)
            .unwrap_or(next.resource_version);
        if current.resource_version != base {
            return Err(MeshError::Conflict {
                resource: format!("node {}", next.name),
            });
        }

        let mut stored = next;
        stored.resource_version = base + 1;
        nodes.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }
}
