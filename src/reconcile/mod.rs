//! Response reconciliation
//!
//! Turns the per-node answers of a replicated operation into the single
//! answer the client sees. The most restrictive status wins, permissions are
//! ANDed, statistics summed and descriptive fields taken from the base node.
//! Partial failures degrade the result into a warning list; only a total
//! failure is an error.

pub mod component;
pub mod counters;
pub mod format;
pub mod merger;
pub mod permissions;
pub mod status;

pub use component::{ComponentEntity, ComponentMerger, ComponentStatus};
pub use counters::{CounterEntry, CountersEntity, CountersMerger};
pub use merger::{DefaultMerger, EntityMerger, MergerRegistry, NodeEntity, ResourceKind};
pub use permissions::Permissions;

use crate::cluster::NodeIdentifier;
use crate::replication::{ClusterOperation, ReplicationOutcome};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A node whose answer did not contribute cleanly to the merged result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblematicNode {
    pub node: NodeIdentifier,
    pub reason: String,
}

/// The single answer produced from every node's response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedResult {
    pub request_id: Uuid,
    pub status: u16,
    pub entity: Option<serde_json::Value>,
    /// Nodes that failed, timed out or answered with a server error
    pub problematic_nodes: Vec<ProblematicNode>,
}

impl MergedResult {
    pub fn is_success(&self) -> bool {
        status::is_success(self.status)
    }

    pub fn has_warnings(&self) -> bool {
        !self.problematic_nodes.is_empty()
    }
}

/// Merges replicated responses using a per-resource-kind strategy
#[derive(Clone, Default)]
pub struct ResponseReconciler {
    mergers: MergerRegistry,
}

impl ResponseReconciler {
    /// Reconciler with the component and counters strategies registered
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(mergers: MergerRegistry) -> Self {
        Self { mergers }
    }

    /// Register (or replace) the strategy for a resource kind
    pub fn register(&mut self, kind: ResourceKind, merger: Arc<dyn EntityMerger>) {
        self.mergers.register(kind, merger);
    }

    /// Produce one result from the outcome of a replicated operation.
    ///
    /// `preferred` names the node whose entity supplies descriptive fields,
    /// normally the node that received the client request. If it did not
    /// answer, the first responding node with an entity is used.
    pub fn reconcile(
        &self,
        operation: &ClusterOperation,
        outcome: ReplicationOutcome,
        preferred: Option<&NodeIdentifier>,
    ) -> Result<MergedResult> {
        if outcome.is_total_failure() {
            warn!(
                request_id = %operation.request_id,
                failures = outcome.failures.len(),
                "No node answered {}",
                operation
            );
            return Err(Error::AllNodesFailed {
                request_id: operation.request_id.to_string(),
                failures: outcome.failures.len(),
            });
        }

        let mut problematic_nodes: Vec<ProblematicNode> = outcome
            .failures
            .iter()
            .map(|failure| ProblematicNode {
                node: failure.node.clone(),
                reason: failure.message.clone(),
            })
            .collect();
        problematic_nodes.extend(
            outcome
                .responses
                .iter()
                .filter(|response| response.is_server_error())
                .map(|response| ProblematicNode {
                    node: response.node.clone(),
                    reason: format!("responded with status {}", response.status),
                }),
        );

        let responses = &outcome.responses;
        let Some(winner) = status::select_status(responses) else {
            return Err(Error::Internal("no status to select".to_string()));
        };

        if !responses[winner].is_success() {
            debug!(
                request_id = %operation.request_id,
                status = responses[winner].status,
                node_id = %responses[winner].node.id(),
                "Most restrictive status wins"
            );
            return Ok(MergedResult {
                request_id: operation.request_id,
                status: responses[winner].status,
                entity: responses[winner].entity.clone(),
                problematic_nodes,
            });
        }

        let base = preferred
            .and_then(|node| {
                responses
                    .iter()
                    .position(|r| r.node == *node && r.entity.is_some())
            })
            .or_else(|| responses.iter().position(|r| r.entity.is_some()));

        let Some(base) = base else {
            // Nothing to merge, e.g. 204 from every node
            return Ok(MergedResult {
                request_id: operation.request_id,
                status: responses[winner].status,
                entity: None,
                problematic_nodes,
            });
        };

        let entities: Vec<NodeEntity<'_>> = responses
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != base)
            .filter_map(|(_, response)| {
                response.entity.as_ref().map(|entity| NodeEntity {
                    node: &response.node,
                    entity,
                })
            })
            .collect();
        let base_entity = NodeEntity {
            node: &responses[base].node,
            entity: responses[base].entity.as_ref().unwrap_or(&serde_json::Value::Null),
        };

        let kind = ResourceKind::classify(operation);
        let merged = match self.mergers.get(kind).merge(base_entity, &entities) {
            Ok(merged) => merged,
            Err(e) => {
                warn!(
                    request_id = %operation.request_id,
                    kind = %kind,
                    "Falling back to default merge: {}",
                    e
                );
                self.mergers.fallback().merge(base_entity, &entities)?
            }
        };

        debug!(
            request_id = %operation.request_id,
            kind = %kind,
            merged_nodes = entities.len() + 1,
            problematic = problematic_nodes.len(),
            "Reconciled {}",
            operation
        );

        Ok(MergedResult {
            request_id: operation.request_id,
            status: responses[base].status,
            entity: Some(merged),
            problematic_nodes,
        })
    }
}
