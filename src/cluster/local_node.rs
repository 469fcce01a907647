//! Receiving side of peer requests for the local node

use super::coordinator::ClusterCoordinator;
use super::node::NodeIdentifier;
use super::offload::OffloadAgent;
use super::transport::{NodeHandler, PeerReply, PeerRequest};
use crate::replication::ClusterOperation;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Executes a replicated operation against this node's own state
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, operation: &ClusterOperation) -> Result<PeerReply>;
}

/// [`NodeHandler`] for the local node.
///
/// Runs replicated operations through the application's
/// [`OperationHandler`], refuses mutating operations while the node is
/// offloading or offloaded, and hands offload notices to the
/// [`OffloadAgent`].
pub struct LocalNodeHandler {
    node: NodeIdentifier,
    coordinator: Arc<ClusterCoordinator>,
    operations: Arc<dyn OperationHandler>,
    offload: Arc<OffloadAgent>,
}

impl LocalNodeHandler {
    pub fn new(
        node: NodeIdentifier,
        coordinator: Arc<ClusterCoordinator>,
        operations: Arc<dyn OperationHandler>,
        offload: Arc<OffloadAgent>,
    ) -> Self {
        Self {
            node,
            coordinator,
            operations,
            offload,
        }
    }
}

#[async_trait]
impl NodeHandler for LocalNodeHandler {
    async fn handle(&self, request: &PeerRequest) -> Result<PeerReply> {
        match request {
            PeerRequest::Replicate(operation) => {
                if operation.is_mutable() {
                    let offloading = self
                        .coordinator
                        .get_status(self.node.id())
                        .is_some_and(|status| status.state.is_offload_phase());
                    if offloading {
                        warn!(
                            node_id = %self.node.id(),
                            operation = %operation,
                            "Rejecting mutable request on offloaded node"
                        );
                        return Err(Error::MutableRequestWhileOffloaded {
                            node_id: self.node.id().to_string(),
                        });
                    }
                }
                self.operations.execute(operation).await
            }
            PeerRequest::Disconnect { code, explanation } => {
                info!(
                    node_id = %self.node.id(),
                    code = ?code,
                    "Local node disconnected from cluster: {}",
                    explanation
                );
                Ok(PeerReply::accepted())
            }
            PeerRequest::Offload { code, explanation } => {
                info!(
                    node_id = %self.node.id(),
                    code = ?code,
                    "Local node asked to offload: {}",
                    explanation
                );
                match self.offload.start_offload() {
                    Ok(_) => Ok(PeerReply::accepted()),
                    Err(e) => {
                        warn!(node_id = %self.node.id(), "Refusing offload: {}", e);
                        Ok(PeerReply::error(409, e.to_string()))
                    }
                }
            }
        }
    }
}
