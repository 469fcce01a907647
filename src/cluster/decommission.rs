//! Decommission of the local node
//!
//! Disconnect, offload, wait for the offload to finish, then remove. Each
//! phase is idempotent, so an interrupted run can simply be started again.
//! Lifecycle requests retry without limit on transient failures and the
//! polls have no overall deadline; the caller stops a run by cancelling it.

use super::connection::{DisconnectionCode, NodeConnectionState, NodeConnectionStatus, OffloadCode};
use super::coordinator::ClusterCoordinator;
use super::dispatcher::LifecycleDispatcher;
use super::retry::{retry_with_backoff, RetryPolicy};
use super::telemetry;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DECOMMISSION_EXPLANATION: &str = "Node is being decommissioned";
const REMOVAL_REASON: &str = "Node decommissioned";

/// Decommission timing
#[derive(Debug, Clone)]
pub struct DecommissionConfig {
    /// Interval between registry checks while waiting on the offload
    pub poll_interval: Duration,
    /// Retry policy for the disconnect and offload requests
    pub retry: RetryPolicy,
}

impl Default for DecommissionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            retry: RetryPolicy::default(),
        }
    }
}

/// Drives the local node out of the cluster
pub struct NodeDecommissioner {
    coordinator: Arc<ClusterCoordinator>,
    dispatcher: Arc<dyn LifecycleDispatcher>,
    config: DecommissionConfig,
    lock: Mutex<()>,
}

impl NodeDecommissioner {
    pub fn new(
        coordinator: Arc<ClusterCoordinator>,
        dispatcher: Arc<dyn LifecycleDispatcher>,
        config: DecommissionConfig,
    ) -> Self {
        Self {
            coordinator,
            dispatcher,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Run the full workflow. A second concurrent call fails with
    /// [`Error::DecommissionInProgress`] instead of queueing.
    pub async fn decommission(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| Error::DecommissionInProgress)?;

        let local = self
            .coordinator
            .local_node_identifier()
            .ok_or(Error::NotClustered)?;
        let node_id = local.id().to_string();
        info!(node_id = %node_id, "Decommissioning local node {}", local);

        telemetry::record_decommission_phase("disconnect");
        info!(node_id = %node_id, "Requesting disconnect");
        retry_with_backoff(&self.config.retry, cancel, "decommission_disconnect", || {
            self.dispatcher.request_disconnect(
                &node_id,
                DisconnectionCode::UserDisconnected,
                DECOMMISSION_EXPLANATION,
            )
        })
        .await?;

        telemetry::record_decommission_phase("offload");
        info!(node_id = %node_id, "Requesting offload");
        retry_with_backoff(&self.config.retry, cancel, "decommission_offload", || {
            self.dispatcher
                .request_offload(&node_id, OffloadCode::Offloaded, DECOMMISSION_EXPLANATION)
        })
        .await?;

        self.poll_status(&node_id, cancel, |status| {
            Ok(status.state.is_offload_phase())
        })
        .await?;

        telemetry::record_decommission_phase("await_offload");
        info!(node_id = %node_id, "Waiting for offload to complete");
        self.poll_status(&node_id, cancel, |status| match status.state {
            NodeConnectionState::Offloaded => Ok(true),
            NodeConnectionState::Offloading => Ok(false),
            other => Err(Error::IllegalState(format!(
                "node {} moved to {} while waiting for its offload to complete",
                status.node_id(),
                other
            ))),
        })
        .await?;

        telemetry::record_decommission_phase("remove");
        info!(node_id = %node_id, "Offload complete, removing node from cluster");
        self.dispatcher.request_removal(&node_id, REMOVAL_REASON);

        info!(node_id = %node_id, "Node decommissioned");
        Ok(())
    }

    /// Poll the local node's status until `done` says so, fails, or the run
    /// is cancelled.
    async fn poll_status<F>(
        &self,
        node_id: &str,
        cancel: &CancellationToken,
        mut done: F,
    ) -> Result<()>
    where
        F: FnMut(&NodeConnectionStatus) -> Result<bool>,
    {
        loop {
            let status = self
                .coordinator
                .get_status(node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

            if done(&status)? {
                return Ok(());
            }
            debug!(node_id = %node_id, state = %status.state, "Still waiting on node state");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
