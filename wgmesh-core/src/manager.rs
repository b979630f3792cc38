//! Node address allocation and restore management.
//!
//! Assigns every cluster node a stable IPv4 mesh address from a configured
//! CIDR and records it on the node's cluster-wide object, where peer nodes
//! later read it to configure their tunnel endpoints. After a control-plane
//! restart the pool starts empty and is rebuilt from the node objects
//! themselves: addresses recorded by a prior run are re-reserved as node
//! events arrive, and nodes still lacking an address are deferred until the
//! full initial node set has been observed.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{MeshConfig, RetryConfig};
use crate::error::{MeshError, MeshResult};
use crate::pool::MeshPool;
use crate::store::{retry_on_conflict, NodeStore};
use crate::types::{NodeAddress, NodeObject};

/// Allocation phase of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Startup: the full set of existing node objects has not been observed
    /// yet, so no new address may be handed out.
    Restoring,
    /// Normal operation: addresses are allocated as nodes appear.
    SteadyState,
}

#[derive(Debug)]
struct ManagerState {
    pool: MeshPool,
    phase: Phase,
    pending_restore: BTreeSet<String>,
}

/// Bookkeeping snapshot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub phase: Phase,
    pub allocated: u64,
    pub capacity: u64,
    pub pending_restore: usize,
}

/// Decides, for every node lifecycle event, whether a mesh address must be
/// freshly allocated, re-reserved from the value already recorded on the
/// node object, or deferred until restore completes.
///
/// Every operation runs under one mutex covering both the decision and any
/// persistence round-trips issued from it, so no two allocations, nor an
/// allocation racing a release, can interleave. The tradeoff is throughput:
/// a retrying persistence call blocks all other node events.
pub struct AllocationManager {
    state: Mutex<ManagerState>,
    store: Arc<dyn NodeStore>,
    retry: RetryConfig,
}

impl AllocationManager {
    /// Create a manager in the restoring phase with an empty pending set.
    pub fn new(config: &MeshConfig, store: Arc<dyn NodeStore>) -> MeshResult<Self> {
        config.validate()?;
        let pool = MeshPool::new(config.subnet, config.reserved.clone())?;

        Ok(Self {
            state: Mutex::new(ManagerState {
                pool,
                phase: Phase::Restoring,
                pending_restore: BTreeSet::new(),
            }),
            store,
            retry: config.persist_retry.clone(),
        })
    }

    /// Handle a node appearing in the cluster.
    pub async fn node_added(&self, node: &NodeObject) -> MeshResult<()> {
        let mut state = self.state.lock().await;
        self.reconcile(&mut state, node).await
    }

    /// Handle a change to an existing node. Same decision logic as
    /// [`node_added`](Self::node_added): the recorded address, not the event
    /// kind, determines what happens.
    pub async fn node_updated(&self, node: &NodeObject) -> MeshResult<()> {
        let mut state = self.state.lock().await;
        self.reconcile(&mut state, node).await
    }

    /// Release the node's recorded mesh address back to the pool.
    ///
    /// Only valid once restore has completed: the event source delivers the
    /// full initial state before any delete, so a delete while restoring
    /// means that contract was broken, and continuing could hand the same
    /// address to two nodes. The violation is returned as a fatal error.
    pub async fn node_deleted(&self, node: &NodeObject) -> MeshResult<()> {
        let mut state = self.state.lock().await;

        if state.phase == Phase::Restoring {
            return Err(MeshError::InvariantViolation {
                message: format!(
                    "node {} deleted while restore is still in progress",
                    node.name
                ),
            });
        }

        let Some(ip) = node.mesh_ipv4() else {
            debug!(node = %node.name, "deleted node had no mesh address");
            return Ok(());
        };

        state.pending_restore.remove(&node.name);
        state.pool.release(ip)?;
        info!(node = %node.name, address = %ip, "released mesh address");
        Ok(())
    }

    /// Complete restore: flip to steady state and allocate an address for
    /// every node deferred while restoring.
    ///
    /// The phase flips before the pending set is drained. If allocation or
    /// persistence fails for a node, the error is returned with that node and
    /// the remainder still pending; each name is removed only after its own
    /// address is allocated and persisted, so calling `resync` again safely
    /// resumes the remainder. Once the manager is in steady state further
    /// calls only drain whatever is still pending.
    pub async fn resync(&self) -> MeshResult<()> {
        let mut state = self.state.lock().await;

        if state.phase == Phase::Restoring {
            info!(
                pending = state.pending_restore.len(),
                "restore complete, entering steady state"
            );
        }
        state.phase = Phase::SteadyState;

        while let Some(name) = state.pending_restore.first().cloned() {
            let ip = state.pool.allocate_next()?;
            self.persist(&name, ip).await?;
            state.pending_restore.remove(&name);
            info!(node = %name, address = %ip, "assigned mesh address after restore");
        }

        Ok(())
    }

    /// Current allocation phase.
    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Node names whose allocation is deferred until restore completes.
    pub async fn pending_nodes(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.pending_restore.iter().cloned().collect()
    }

    /// Snapshot of the manager's bookkeeping.
    pub async fn stats(&self) -> ManagerStats {
        let state = self.state.lock().await;
        ManagerStats {
            phase: state.phase,
            allocated: state.pool.allocated_count(),
            capacity: state.pool.capacity(),
            pending_restore: state.pending_restore.len(),
        }
    }

    /// Shared decision logic for added and updated nodes. Must be called with
    /// the state lock held.
    async fn reconcile(&self, state: &mut ManagerState, node: &NodeObject) -> MeshResult<()> {
        if let Some(ip) = node.mesh_ipv4() {
            // An address committed by a prior run: re-mark it before any new
            // address is handed out, so the freshly built pool cannot reuse
            // it. Failure here means the pool's view and the node objects
            // disagree; that is surfaced, not auto-resolved.
            return match state.pool.allocate(ip) {
                Ok(()) => {
                    debug!(node = %node.name, address = %ip, "re-reserved recorded mesh address");
                    Ok(())
                }
                Err(MeshError::AlreadyExists { .. }) => Err(MeshError::AlreadyExists {
                    resource: format!("mesh address {} recorded on node {}", ip, node.name),
                }),
                Err(err) => Err(err),
            };
        }

        match state.phase {
            Phase::Restoring => {
                // Node objects not seen yet may hold addresses this pool does
                // not know about; allocating now could clash with one of them.
                debug!(node = %node.name, "deferring allocation until restore completes");
                state.pending_restore.insert(node.name.clone());
                Ok(())
            }
            Phase::SteadyState => {
                let ip = state.pool.allocate_next()?;
                self.persist(&node.name, ip).await?;
                info!(node = %node.name, address = %ip, "assigned mesh address");
                Ok(())
            }
        }
    }

    /// Record `ip` as the node's mesh address via read-modify-write.
    ///
    /// Every attempt starts from a freshly fetched object: the write replaces
    /// the whole address list, so mutating a stale copy would drop addresses
    /// written concurrently. On retry exhaustion the conflict error is
    /// returned and the pool keeps `ip` allocated; allocation and persistence
    /// are not atomic across that failure.
    async fn persist(&self, name: &str, ip: Ipv4Addr) -> MeshResult<()> {
        let store = &self.store;
        retry_on_conflict(&self.retry, move || async move {
            let mut node = store.get(name).await?;
            node.addresses.push(NodeAddress::mesh(ip));
            store.update(None, node).await?;
            Ok(())
        })
        .await
    }
}
