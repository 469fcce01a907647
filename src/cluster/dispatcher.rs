//! Lifecycle request dispatcher
//!
//! Sends disconnect and offload requests for a node and reports a single
//! attempt's outcome. Retrying is the caller's job.

use super::connection::{DisconnectionCode, NodeConnectionState, OffloadCode};
use super::coordinator::ClusterCoordinator;
use super::telemetry;
use super::transport::{NodeTransport, PeerRequest};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Asynchronous lifecycle requests against a node
#[async_trait]
pub trait LifecycleDispatcher: Send + Sync {
    /// Ask for `node_id` to be disconnected. Resolves once acknowledged.
    async fn request_disconnect(
        &self,
        node_id: &str,
        code: DisconnectionCode,
        explanation: &str,
    ) -> Result<()>;

    /// Ask for `node_id` to start offloading. Resolves once the node has
    /// accepted the request; completion is observed through the registry.
    async fn request_offload(
        &self,
        node_id: &str,
        code: OffloadCode,
        explanation: &str,
    ) -> Result<()>;

    /// Remove `node_id` from the cluster without waiting for an answer.
    fn request_removal(&self, node_id: &str, reason: &str);
}

/// Dispatcher that applies transitions through a coordinator in this
/// process and notifies the target node over a [`NodeTransport`].
pub struct ClusterLifecycleDispatcher {
    coordinator: Arc<ClusterCoordinator>,
    transport: Arc<dyn NodeTransport>,
    request_timeout: Duration,
}

impl ClusterLifecycleDispatcher {
    pub fn new(
        coordinator: Arc<ClusterCoordinator>,
        transport: Arc<dyn NodeTransport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            transport,
            request_timeout,
        }
    }

    async fn notify(&self, node_id: &str, request: PeerRequest) -> Result<()> {
        let kind = request.kind();
        let status = self
            .coordinator
            .get_status(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let reply = tokio::time::timeout(
            self.request_timeout,
            self.transport.send(&status.node, &request),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("{} request to node {}", kind, node_id),
            after: self.request_timeout,
        })??;

        if reply.is_success() {
            debug!(
                node_id = %node_id,
                kind,
                status = reply.status,
                "Node acknowledged lifecycle request"
            );
            Ok(())
        } else {
            Err(Error::Rejected {
                node_id: node_id.to_string(),
                status: reply.status,
                message: reply.message().unwrap_or("no message").to_string(),
            })
        }
    }
}

#[async_trait]
impl LifecycleDispatcher for ClusterLifecycleDispatcher {
    async fn request_disconnect(
        &self,
        node_id: &str,
        code: DisconnectionCode,
        explanation: &str,
    ) -> Result<()> {
        let status = self.coordinator.begin_disconnect(node_id, code, explanation)?;
        if status.state != NodeConnectionState::Disconnecting {
            debug!(node_id = %node_id, state = %status.state, "Node already out of the cluster");
            telemetry::record_lifecycle_request("disconnect", "noop");
            return Ok(());
        }

        let request = PeerRequest::Disconnect {
            code,
            explanation: explanation.to_string(),
        };
        if let Err(e) = self.notify(node_id, request).await {
            warn!(node_id = %node_id, "Disconnect request was not acknowledged: {}", e);
            telemetry::record_lifecycle_request("disconnect", "failed");
            return Err(e);
        }

        self.coordinator.finish_disconnect(node_id)?;
        info!(node_id = %node_id, code = ?code, "Node disconnected: {}", explanation);
        telemetry::record_lifecycle_request("disconnect", "ok");
        Ok(())
    }

    async fn request_offload(
        &self,
        node_id: &str,
        code: OffloadCode,
        explanation: &str,
    ) -> Result<()> {
        let status = self.coordinator.begin_offload(node_id, code, explanation)?;
        if status.state == NodeConnectionState::Offloaded {
            debug!(node_id = %node_id, "Node already offloaded");
            telemetry::record_lifecycle_request("offload", "noop");
            return Ok(());
        }

        let request = PeerRequest::Offload {
            code,
            explanation: explanation.to_string(),
        };
        if let Err(e) = self.notify(node_id, request).await {
            warn!(node_id = %node_id, "Offload request was not acknowledged: {}", e);
            telemetry::record_lifecycle_request("offload", "failed");
            return Err(e);
        }

        info!(node_id = %node_id, code = ?code, "Node accepted offload request: {}", explanation);
        telemetry::record_lifecycle_request("offload", "ok");
        Ok(())
    }

    fn request_removal(&self, node_id: &str, reason: &str) {
        match self.coordinator.remove_node(node_id, reason) {
            Ok(()) => telemetry::record_lifecycle_request("remove", "ok"),
            Err(e) => {
                warn!(node_id = %node_id, "Failed to remove node: {}", e);
                telemetry::record_lifecycle_request("remove", "failed");
            }
        }
    }
}
