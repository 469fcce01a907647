//! Cluster request replicator
//!
//! Fans one logical operation out to every connected node in parallel and
//! collects a response or a failure per node. Slow or dead nodes are bounded
//! by a per-node timeout and recorded as failures; they never stall the
//! request. How failures affect the merged answer is up to the reconciler.

use super::operation::ClusterOperation;
use super::response::{FailureKind, NodeFailure, NodeResponse, ReplicationOutcome};
use crate::cluster::telemetry::{self, ReplicationMetrics};
use crate::cluster::{ClusterCoordinator, NodeIdentifier, NodeTransport, PeerRequest};
use crate::reconcile::{MergedResult, ResponseReconciler};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Replicates cluster operations to connected nodes
pub struct RequestReplicator {
    coordinator: Arc<ClusterCoordinator>,
    transport: Arc<dyn NodeTransport>,
    reconciler: Arc<ResponseReconciler>,
    /// Default per-node bound
    timeout: Duration,
    allow_mutations_while_unstable: bool,
}

impl RequestReplicator {
    pub fn new(
        coordinator: Arc<ClusterCoordinator>,
        transport: Arc<dyn NodeTransport>,
        reconciler: Arc<ResponseReconciler>,
    ) -> Self {
        let config = coordinator.config();
        let timeout = config.replication_timeout;
        let allow_mutations_while_unstable = config.allow_mutations_while_unstable;
        Self {
            coordinator,
            transport,
            reconciler,
            timeout,
            allow_mutations_while_unstable,
        }
    }

    /// Create with a custom per-node timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replicate to every connected node and merge the answers.
    ///
    /// This is the main entry point for cluster-wide requests.
    pub async fn execute(&self, operation: &ClusterOperation) -> Result<MergedResult> {
        let outcome = self.replicate(operation).await?;
        let local = self.coordinator.local_node_identifier();
        self.reconciler.reconcile(operation, outcome, local.as_ref())
    }

    /// Send `operation` to every CONNECTED node.
    pub async fn replicate(&self, operation: &ClusterOperation) -> Result<ReplicationOutcome> {
        if operation.is_mutable() {
            self.check_mutation_allowed()?;
        }

        let nodes = self.coordinator.connected_nodes();
        if nodes.is_empty() {
            return Err(Error::NoConnectedNodes);
        }

        self.fan_out(&nodes, operation).await
    }

    /// Send `operation` to an explicit set of nodes.
    ///
    /// Mutating operations fail with [`Error::MutableRequestWhileOffloaded`]
    /// if any target is offloading or offloaded.
    pub async fn replicate_to(
        &self,
        nodes: &[NodeIdentifier],
        operation: &ClusterOperation,
    ) -> Result<ReplicationOutcome> {
        if nodes.is_empty() {
            return Err(Error::NoConnectedNodes);
        }

        if operation.is_mutable() {
            for node in nodes {
                let offloading = self
                    .coordinator
                    .get_status(node.id())
                    .is_some_and(|status| status.state.is_offload_phase());
                if offloading {
                    return Err(Error::MutableRequestWhileOffloaded {
                        node_id: node.id().to_string(),
                    });
                }
            }
        }

        self.fan_out(nodes, operation).await
    }

    fn check_mutation_allowed(&self) -> Result<()> {
        if let Some(local) = self.coordinator.local_node_identifier() {
            let offloading = self
                .coordinator
                .get_status(local.id())
                .is_some_and(|status| status.state.is_offload_phase());
            if offloading {
                return Err(Error::MutableRequestWhileOffloaded {
                    node_id: local.id().to_string(),
                });
            }
        }

        let summary = self.coordinator.summary();
        if summary.is_unstable() && !self.allow_mutations_while_unstable {
            return Err(Error::IllegalClusterState(format!(
                "{} node(s) connecting and {} node(s) disconnecting; \
                 mutable requests are refused until the cluster settles",
                summary.connecting_nodes,
                summary.disconnecting_nodes
            )));
        }

        Ok(())
    }

    async fn fan_out(
        &self,
        nodes: &[NodeIdentifier],
        operation: &ClusterOperation,
    ) -> Result<ReplicationOutcome> {
        let started = Instant::now();
        let timeout = operation.timeout.unwrap_or(self.timeout);
        let request = PeerRequest::Replicate(operation.clone());

        debug!(
            request_id = %operation.request_id,
            nodes = nodes.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Replicating {} across nodes",
            operation
        );

        let calls = nodes.iter().map(|node| {
            let request = &request;
            async move {
                let sent = Instant::now();
                let result =
                    tokio::time::timeout(timeout, self.transport.send(node, request)).await;
                (node, sent.elapsed(), result)
            }
        });
        let results = futures::future::join_all(calls).await;

        let mut outcome = ReplicationOutcome::new(operation.request_id);
        for (node, latency, result) in results {
            match result {
                Ok(Ok(reply)) => {
                    telemetry::record_node_response("response", latency.as_secs_f64());
                    outcome.responses.push(NodeResponse {
                        node: node.clone(),
                        status: reply.status,
                        entity: reply.body,
                        latency,
                        request_id: operation.request_id,
                    });
                }
                Ok(Err(e)) => {
                    let kind = if e.is_transient() {
                        FailureKind::Transport
                    } else {
                        FailureKind::Refused
                    };
                    warn!(
                        node_id = %node.id(),
                        request_id = %operation.request_id,
                        "Replicated request failed on node: {}",
                        e
                    );
                    telemetry::record_node_response("failed", latency.as_secs_f64());
                    outcome.failures.push(NodeFailure {
                        node: node.clone(),
                        kind,
                        message: e.to_string(),
                        latency,
                    });
                }
                Err(_) => {
                    warn!(
                        node_id = %node.id(),
                        request_id = %operation.request_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Replicated request timed out on node"
                    );
                    telemetry::record_node_response("timeout", latency.as_secs_f64());
                    outcome.failures.push(NodeFailure {
                        node: node.clone(),
                        kind: FailureKind::Timeout,
                        message: format!("no response within {}ms", timeout.as_millis()),
                        latency,
                    });
                }
            }
        }
        outcome.sort();

        let outcome_label = if outcome.is_total_failure() {
            "failed"
        } else if outcome.failures.is_empty() {
            "complete"
        } else {
            "partial"
        };
        telemetry::record_replication(ReplicationMetrics {
            outcome: outcome_label,
            mutable: operation.is_mutable(),
            duration_seconds: started.elapsed().as_secs_f64(),
            problematic_nodes: outcome.failures.len() as u64,
        });

        Ok(outcome)
    }
}
