//! Node lifecycle event delivery.
//!
//! Bridges the node event source (typically a watch over node objects) to
//! the allocation manager. Per-node events arrive in creation order; no
//! ordering holds across distinct nodes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::MeshResult;
use crate::manager::AllocationManager;
use crate::types::NodeObject;

/// Lifecycle event delivered by the node watch.
///
/// Serializable so event streams can be recorded and replayed offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NodeEvent {
    Added { node: NodeObject },
    Updated { node: NodeObject },
    Deleted { node: NodeObject },
    /// The full initial node set has been observed.
    Resync,
}

/// Drives the allocation manager from a stream of node events.
pub struct AllocationService {
    manager: Arc<AllocationManager>,
    events: mpsc::Receiver<NodeEvent>,
}

impl AllocationService {
    pub fn new(manager: Arc<AllocationManager>, events: mpsc::Receiver<NodeEvent>) -> Self {
        Self { manager, events }
    }

    /// Dispatch events until the channel closes.
    ///
    /// Recoverable errors are logged and the loop keeps running; the event
    /// source is expected to redeliver the triggering event. An invariant
    /// violation stops the service and is returned, to be treated as a crash
    /// signal by the supervising layer.
    pub async fn run(mut self) -> MeshResult<()> {
        info!("starting mesh allocation service");

        while let Some(event) = self.events.recv().await {
            if let Err(err) = self.dispatch(&event).await {
                if err.is_fatal() {
                    error!(%err, "allocation invariant violated");
                    return Err(err);
                }
                warn!(%err, "failed to handle node event");
            }
        }

        info!("node event channel closed, stopping allocation service");
        Ok(())
    }

    async fn dispatch(&self, event: &NodeEvent) -> MeshResult<()> {
        match event {
            NodeEvent::Added { node } => self.manager.node_added(node).await,
            NodeEvent::Updated { node } => self.manager.node_updated(node).await,
            NodeEvent::Deleted { node } => self.manager.node_deleted(node).await,
            NodeEvent::Resync => self.manager.resync().await,
        }
    }
}
