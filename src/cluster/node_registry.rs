//! Node connection registry
//!
//! Authoritative map of node ID -> connection status. Statuses are stored
//! behind `Arc` and swapped whole, so a reader always sees a status that was
//! written in full. Writers to different node IDs land on different map
//! shards and do not contend.

use super::connection::{NodeConnectionState, NodeConnectionStatus};
use super::node::NodeIdentifier;
use crate::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of node connection statuses
pub struct NodeRegistry {
    /// Map of node ID -> current status
    statuses: DashMap<String, Arc<NodeConnectionStatus>>,
    /// Identity of the process holding this registry, once it has joined
    local_node: RwLock<Option<NodeIdentifier>>,
    /// Source of update IDs stamped onto stored statuses
    sequence: AtomicU64,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            statuses: DashMap::new(),
            local_node: RwLock::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Record the identity of the local node
    pub fn set_local_node_identifier(&self, node: NodeIdentifier) {
        info!(node_id = %node.id(), "Local node identifier set to {}", node);
        *self.local_node.write() = Some(node.as_local());
    }

    /// Identity of the local node, absent before it has joined
    pub fn local_node_identifier(&self) -> Option<NodeIdentifier> {
        self.local_node.read().clone()
    }

    /// Current status of a node
    pub fn get_status(&self, node_id: &str) -> Option<Arc<NodeConnectionStatus>> {
        self.statuses.get(node_id).map(|entry| entry.value().clone())
    }

    /// Unconditionally replace a node's status.
    ///
    /// Only the coordinator, which owns transition decisions, should call this.
    pub fn set_status(&self, status: NodeConnectionStatus) -> Arc<NodeConnectionStatus> {
        let status = self.stamp(status);
        debug!(
            node_id = %status.node_id(),
            state = %status.state,
            update_id = status.update_id,
            "Setting node status"
        );
        self.statuses
            .insert(status.node_id().to_string(), status.clone());
        status
    }

    /// Atomically read, decide, and replace a single node's status.
    ///
    /// `decide` sees the current status (if any) while the entry is locked
    /// and returns the replacement, or `None` to leave it untouched. Returns
    /// the status stored after the call. `decide` must not call back into
    /// the registry.
    pub fn update<F>(&self, node_id: &str, decide: F) -> Result<Option<Arc<NodeConnectionStatus>>>
    where
        F: FnOnce(Option<&NodeConnectionStatus>) -> Result<Option<NodeConnectionStatus>>,
    {
        match self.statuses.entry(node_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let decision = decide(Some(entry.get().as_ref()))?;
                match decision {
                    Some(next) => {
                        let next = self.stamp(next);
                        entry.insert(next.clone());
                        Ok(Some(next))
                    }
                    None => Ok(Some(entry.get().clone())),
                }
            }
            Entry::Vacant(entry) => match decide(None)? {
                Some(next) => {
                    let next = self.stamp(next);
                    entry.insert(next.clone());
                    Ok(Some(next))
                }
                None => Ok(None),
            },
        }
    }

    /// Delete a node's entry. Absent nodes are ignored.
    pub fn remove_node(&self, node_id: &str, reason: &str) -> Option<Arc<NodeConnectionStatus>> {
        let removed = self.statuses.remove(node_id).map(|(_, status)| status);
        if removed.is_some() {
            info!(node_id = %node_id, reason = %reason, "Removed node from registry");
        }
        removed
    }

    /// Delete a node's entry only if `allowed` accepts its current status.
    ///
    /// Returns `None` when the node is absent, `Ok` with the removed status,
    /// or `Err` with the status that was kept.
    pub fn remove_node_if<P>(
        &self,
        node_id: &str,
        reason: &str,
        allowed: P,
    ) -> Option<std::result::Result<Arc<NodeConnectionStatus>, Arc<NodeConnectionStatus>>>
    where
        P: FnOnce(&NodeConnectionStatus) -> bool,
    {
        match self.statuses.remove_if(node_id, |_, status| allowed(status)) {
            Some((_, removed)) => {
                info!(node_id = %node_id, reason = %reason, "Removed node from registry");
                Some(Ok(removed))
            }
            None => self.get_status(node_id).map(Err),
        }
    }

    /// Snapshot of every stored status
    pub fn get_all_statuses(&self) -> Vec<Arc<NodeConnectionStatus>> {
        self.statuses.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Nodes currently in any of the given states, ordered by ID
    pub fn nodes_in_state(&self, states: &[NodeConnectionState]) -> Vec<NodeIdentifier> {
        let mut nodes: Vec<_> = self
            .statuses
            .iter()
            .filter(|entry| states.contains(&entry.value().state))
            .map(|entry| entry.value().node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    /// Count of nodes per connection state
    pub fn get_summary(&self) -> ClusterSummary {
        let mut summary = ClusterSummary::default();
        for entry in self.statuses.iter() {
            summary.total_nodes += 1;
            match entry.value().state {
                NodeConnectionState::Connecting => summary.connecting_nodes += 1,
                NodeConnectionState::Connected => summary.connected_nodes += 1,
                NodeConnectionState::Disconnecting => summary.disconnecting_nodes += 1,
                NodeConnectionState::Disconnected => summary.disconnected_nodes += 1,
                NodeConnectionState::Offloading => summary.offloading_nodes += 1,
                NodeConnectionState::Offloaded => summary.offloaded_nodes += 1,
            }
        }
        summary
    }

    fn stamp(&self, mut status: NodeConnectionStatus) -> Arc<NodeConnectionStatus> {
        status.update_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(status)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cluster membership counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub connecting_nodes: usize,
    pub connected_nodes: usize,
    pub disconnecting_nodes: usize,
    pub disconnected_nodes: usize,
    pub offloading_nodes: usize,
    pub offloaded_nodes: usize,
}

impl ClusterSummary {
    /// `"<connected> / <total>"`
    pub fn connected_display(&self) -> String {
        format!("{} / {}", self.connected_nodes, self.total_nodes)
    }

    /// Whether some node sits between stable states
    pub fn is_unstable(&self) -> bool {
        self.connecting_nodes > 0 || self.disconnecting_nodes > 0
    }
}
