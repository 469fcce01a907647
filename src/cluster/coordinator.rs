//! Cluster coordinator
//!
//! Owns the node registry and makes every authoritative connection state
//! decision: handshakes, heartbeats, disconnects, offloads and removal.
//! Constructed explicitly and shared through `Arc`; there is no global
//! coordinator instance.

use super::connection::{DisconnectionCode, NodeConnectionState, NodeConnectionStatus, OffloadCode};
use super::node::NodeIdentifier;
use super::node_registry::{ClusterSummary, NodeRegistry};
use super::telemetry;
use super::ClusterConfig;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic liveness report sent by every node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub node: NodeIdentifier,
    /// State the node believes it is in
    pub reported_state: NodeConnectionState,
    /// Fingerprint of the node's copy of the shared cluster state
    pub cluster_fingerprint: Option<String>,
}

impl Heartbeat {
    pub fn new(node: NodeIdentifier, reported_state: NodeConnectionState) -> Self {
        Self {
            node,
            reported_state,
            cluster_fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.cluster_fingerprint = Some(fingerprint.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct HeartbeatRecord {
    last_seen: Instant,
    connecting_since: Option<Instant>,
    fingerprint_mismatch: bool,
}

/// Authoritative owner of connection state transitions
pub struct ClusterCoordinator {
    registry: Arc<NodeRegistry>,
    heartbeats: DashMap<String, HeartbeatRecord>,
    cluster_fingerprint: RwLock<Option<String>>,
    config: ClusterConfig,
}

impl ClusterCoordinator {
    /// Create a coordinator owning the given registry
    pub fn new(registry: Arc<NodeRegistry>, config: ClusterConfig) -> Self {
        Self {
            registry,
            heartbeats: DashMap::new(),
            cluster_fingerprint: RwLock::new(None),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local_node_identifier(&self) -> Option<NodeIdentifier> {
        self.registry.local_node_identifier()
    }

    pub fn set_local_node_identifier(&self, node: NodeIdentifier) {
        self.registry.set_local_node_identifier(node);
    }

    pub fn get_status(&self, node_id: &str) -> Option<Arc<NodeConnectionStatus>> {
        self.registry.get_status(node_id)
    }

    pub fn nodes_in_state(&self, states: &[NodeConnectionState]) -> Vec<NodeIdentifier> {
        self.registry.nodes_in_state(states)
    }

    pub fn connected_nodes(&self) -> Vec<NodeIdentifier> {
        self.registry.nodes_in_state(&[NodeConnectionState::Connected])
    }

    pub fn summary(&self) -> ClusterSummary {
        self.registry.get_summary()
    }

    /// Fingerprint every connecting node must match, once one is known
    pub fn cluster_fingerprint(&self) -> Option<String> {
        self.cluster_fingerprint.read().clone()
    }

    /// Handle a node asking to join (or rejoin) the cluster.
    pub fn request_connection(&self, node: NodeIdentifier) -> Result<Arc<NodeConnectionStatus>> {
        let node_id = node.id().to_string();
        let status = self.apply(&node_id, |current| match current {
            None => Ok(Some(NodeConnectionStatus::connecting(node))),
            Some(status) => match status.state {
                NodeConnectionState::Connecting | NodeConnectionState::Connected => Ok(None),
                _ => {
                    status.validate_transition(NodeConnectionState::Connecting)?;
                    Ok(Some(NodeConnectionStatus::connecting(node)))
                }
            },
        })?;

        if status.state == NodeConnectionState::Connecting {
            let now = Instant::now();
            self.heartbeats
                .entry(node_id)
                .and_modify(|record| {
                    record.last_seen = now;
                    record.connecting_since.get_or_insert(now);
                })
                .or_insert(HeartbeatRecord {
                    last_seen: now,
                    connecting_since: Some(now),
                    fingerprint_mismatch: false,
                });
        }

        Ok(status)
    }

    /// Process a heartbeat and apply whatever transition it completes.
    pub fn handle_heartbeat(&self, heartbeat: Heartbeat) -> Result<Arc<NodeConnectionStatus>> {
        let node_id = heartbeat.node.id().to_string();

        let Some(current) = self.registry.get_status(&node_id) else {
            debug!(
                node_id = %node_id,
                "Heartbeat from unknown node, treating as connection request"
            );
            let status = self.request_connection(heartbeat.node.clone())?;
            return self.complete_handshake(&heartbeat, status);
        };

        self.touch(&node_id);

        match (current.state, heartbeat.reported_state) {
            (NodeConnectionState::Connecting, _) => self.complete_handshake(&heartbeat, current),
            (NodeConnectionState::Disconnecting, NodeConnectionState::Disconnected) => {
                self.finish_disconnect(&node_id)
            }
            (NodeConnectionState::Offloading, NodeConnectionState::Offloaded) => {
                self.finish_offload(&node_id)
            }
            (
                NodeConnectionState::Disconnected | NodeConnectionState::Offloaded,
                NodeConnectionState::Connected | NodeConnectionState::Connecting,
            ) => {
                warn!(
                    node_id = %node_id,
                    state = %current.state,
                    "Ignoring heartbeat from node outside the cluster until it requests connection"
                );
                Ok(current)
            }
            _ => Ok(current),
        }
    }

    /// Move a node toward DISCONNECTED.
    ///
    /// Nodes already disconnected or on the offload path are left alone.
    pub fn begin_disconnect(
        &self,
        node_id: &str,
        code: DisconnectionCode,
        explanation: &str,
    ) -> Result<Arc<NodeConnectionStatus>> {
        self.apply(node_id, |current| {
            let status = current.ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            match status.state {
                NodeConnectionState::Connecting | NodeConnectionState::Connected => {
                    Ok(Some(NodeConnectionStatus::disconnecting(
                        status.node.clone(),
                        code,
                        explanation,
                    )))
                }
                NodeConnectionState::Disconnecting
                | NodeConnectionState::Disconnected
                | NodeConnectionState::Offloading
                | NodeConnectionState::Offloaded => Ok(None),
            }
        })
    }

    /// Complete a disconnect started by [`begin_disconnect`](Self::begin_disconnect).
    pub fn finish_disconnect(&self, node_id: &str) -> Result<Arc<NodeConnectionStatus>> {
        self.apply(node_id, |current| {
            let status = current.ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            if status.state != NodeConnectionState::Disconnecting {
                return Ok(None);
            }
            let code = status
                .disconnection_code
                .unwrap_or(DisconnectionCode::UserDisconnected);
            let explanation = status
                .explanation
                .clone()
                .unwrap_or_else(|| code.description().to_string());
            Ok(Some(NodeConnectionStatus::disconnected(
                status.node.clone(),
                code,
                explanation,
            )))
        })
    }

    /// Disconnect a node in one step; used when the node cannot be asked.
    pub fn disconnect(
        &self,
        node_id: &str,
        code: DisconnectionCode,
        explanation: &str,
    ) -> Result<Arc<NodeConnectionStatus>> {
        self.begin_disconnect(node_id, code, explanation)?;
        self.finish_disconnect(node_id)
    }

    /// Move a CONNECTED or DISCONNECTED node to OFFLOADING.
    pub fn begin_offload(
        &self,
        node_id: &str,
        code: OffloadCode,
        explanation: &str,
    ) -> Result<Arc<NodeConnectionStatus>> {
        self.apply(node_id, |current| {
            let status = current.ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            if status.state.is_offload_phase() {
                return Ok(None);
            }
            status.validate_transition(NodeConnectionState::Offloading)?;
            Ok(Some(NodeConnectionStatus::offloading(
                status.node.clone(),
                code,
                explanation,
            )))
        })
    }

    /// Mark an OFFLOADING node as OFFLOADED.
    pub fn finish_offload(&self, node_id: &str) -> Result<Arc<NodeConnectionStatus>> {
        self.apply(node_id, |current| {
            let status = current.ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            if status.state == NodeConnectionState::Offloaded {
                return Ok(None);
            }
            status.validate_transition(NodeConnectionState::Offloaded)?;
            let code = status.offload_code.unwrap_or(OffloadCode::Offloaded);
            let explanation = status
                .explanation
                .clone()
                .unwrap_or_else(|| code.description().to_string());
            Ok(Some(NodeConnectionStatus::offloaded(
                status.node.clone(),
                code,
                explanation,
            )))
        })
    }

    /// Abandon an offload; the node drops back to DISCONNECTED.
    pub fn fail_offload(
        &self,
        node_id: &str,
        explanation: &str,
    ) -> Result<Arc<NodeConnectionStatus>> {
        self.apply(node_id, |current| {
            let status = current.ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            status.validate_transition(NodeConnectionState::Disconnected)?;
            let mut next = NodeConnectionStatus::disconnected(
                status.node.clone(),
                DisconnectionCode::FailedToServiceRequest,
                explanation,
            );
            next.offload_code = Some(OffloadCode::OffloadFailed);
            Ok(Some(next))
        })
    }

    /// Remove a DISCONNECTED or OFFLOADED node from the cluster.
    ///
    /// Removing an absent node succeeds. Removing a node in any other state
    /// is rejected.
    pub fn remove_node(&self, node_id: &str, reason: &str) -> Result<()> {
        match self.registry.remove_node_if(node_id, reason, |status| {
            status.state.is_removable()
        }) {
            Some(Err(status)) => Err(Error::IllegalState(format!(
                "cannot remove node {} while it is {}",
                node_id, status.state
            ))),
            Some(Ok(status)) => {
                self.heartbeats.remove(node_id);
                info!(node_id = %node_id, reason = %reason, "Node removed from cluster");
                telemetry::record_removal(status.state);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Periodically disconnect nodes that stopped heartbeating or never
    /// finished their handshake.
    pub async fn run_heartbeat_monitor(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Heartbeat monitor stopped");
                    return;
                }
                _ = interval.tick() => self.check_heartbeats(),
            }
        }
    }

    /// One pass of the heartbeat monitor
    pub fn check_heartbeats(&self) {
        let now = Instant::now();

        for status in self.registry.get_all_statuses() {
            let node_id = status.node_id();
            let Some(record) = self.heartbeats.get(node_id).map(|r| *r) else {
                continue;
            };

            let outcome = match status.state {
                NodeConnectionState::Connected => {
                    let elapsed = now.duration_since(record.last_seen);
                    if elapsed <= self.config.node_timeout {
                        continue;
                    }
                    warn!(
                        node_id = %node_id,
                        elapsed_secs = elapsed.as_secs(),
                        "Node missed heartbeats, disconnecting"
                    );
                    self.disconnect(
                        node_id,
                        DisconnectionCode::LackOfHeartbeat,
                        &format!("No heartbeat received for {} seconds", elapsed.as_secs()),
                    )
                }
                NodeConnectionState::Connecting => {
                    let since = record.connecting_since.unwrap_or(record.last_seen);
                    let elapsed = now.duration_since(since);
                    if elapsed <= self.config.connection_timeout {
                        continue;
                    }
                    let code = if record.fingerprint_mismatch {
                        DisconnectionCode::ClusterStateMismatch
                    } else {
                        DisconnectionCode::NotYetConnected
                    };
                    warn!(
                        node_id = %node_id,
                        elapsed_secs = elapsed.as_secs(),
                        code = ?code,
                        "Node did not complete its handshake in time, disconnecting"
                    );
                    self.disconnect(
                        node_id,
                        code,
                        &format!("Handshake not completed within {} seconds", elapsed.as_secs()),
                    )
                }
                // Never acknowledged the disconnect notice
                NodeConnectionState::Disconnecting => {
                    let elapsed = now.duration_since(record.last_seen);
                    if elapsed <= self.config.node_timeout {
                        continue;
                    }
                    debug!(
                        node_id = %node_id,
                        elapsed_secs = elapsed.as_secs(),
                        "Disconnecting node went silent, completing disconnect"
                    );
                    self.finish_disconnect(node_id)
                }
                _ => continue,
            };

            if let Err(e) = outcome {
                debug!(node_id = %node_id, "Heartbeat monitor transition skipped: {}", e);
            }
        }
    }

    fn complete_handshake(
        &self,
        heartbeat: &Heartbeat,
        current: Arc<NodeConnectionStatus>,
    ) -> Result<Arc<NodeConnectionStatus>> {
        if current.state != NodeConnectionState::Connecting {
            return Ok(current);
        }

        let node_id = heartbeat.node.id();
        if !self.fingerprint_matches(heartbeat.cluster_fingerprint.as_deref()) {
            warn!(
                node_id = %node_id,
                "Node's cluster state is inconsistent with the cluster; it remains CONNECTING"
            );
            if let Some(mut record) = self.heartbeats.get_mut(node_id) {
                record.fingerprint_mismatch = true;
            }
            return Ok(current);
        }

        let node = heartbeat.node.clone();
        let status = self.apply(node_id, |current| match current {
            Some(status) if status.state == NodeConnectionState::Connecting => {
                Ok(Some(NodeConnectionStatus::connected(node)))
            }
            Some(_) => Ok(None),
            None => Err(Error::NodeNotFound(node.id().to_string())),
        })?;

        if let Some(mut record) = self.heartbeats.get_mut(node_id) {
            record.connecting_since = None;
            record.fingerprint_mismatch = false;
        }
        Ok(status)
    }

    /// Adopts the first fingerprint seen as the cluster's.
    fn fingerprint_matches(&self, fingerprint: Option<&str>) -> bool {
        let Some(fingerprint) = fingerprint else {
            return true;
        };

        let mut expected = self.cluster_fingerprint.write();
        match expected.as_deref() {
            Some(existing) => existing == fingerprint,
            None => {
                info!(fingerprint = %fingerprint, "Adopting cluster fingerprint");
                *expected = Some(fingerprint.to_string());
                true
            }
        }
    }

    fn touch(&self, node_id: &str) {
        let now = Instant::now();
        self.heartbeats
            .entry(node_id.to_string())
            .and_modify(|record| record.last_seen = now)
            .or_insert(HeartbeatRecord {
                last_seen: now,
                connecting_since: None,
                fingerprint_mismatch: false,
            });
    }

    /// Apply a transition through the registry and log it when the state changes.
    fn apply<F>(&self, node_id: &str, decide: F) -> Result<Arc<NodeConnectionStatus>>
    where
        F: FnOnce(Option<&NodeConnectionStatus>) -> Result<Option<NodeConnectionStatus>>,
    {
        let mut previous = None;
        let stored = self.registry.update(node_id, |current| {
            previous = current.map(|status| status.state);
            decide(current)
        })?;
        let stored = stored.ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        if previous != Some(stored.state) {
            match previous {
                Some(from) => info!(
                    node_id = %node_id,
                    from = %from,
                    to = %stored.state,
                    "Node connection state changed: {}",
                    stored
                ),
                None => info!(
                    node_id = %node_id,
                    to = %stored.state,
                    "Node registered: {}",
                    stored
                ),
            }
            telemetry::record_transition(previous, stored.state);
        }

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> ClusterCoordinator {
        ClusterCoordinator::new(Arc::new(NodeRegistry::new()), ClusterConfig::default())
    }

    fn node(id: &str) -> NodeIdentifier {
        NodeIdentifier::new(id, "127.0.0.1", 8080)
    }

    fn connect(coordinator: &ClusterCoordinator, id: &str) {
        coordinator
            .handle_heartbeat(Heartbeat::new(node(id), NodeConnectionState::Connecting))
            .unwrap();
        let status = coordinator
            .handle_heartbeat(Heartbeat::new(node(id), NodeConnectionState::Connecting))
            .unwrap();
        assert_eq!(status.state, NodeConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_first_heartbeat_connects_node() {
        let coordinator = coordinator();
        let status = coordinator
            .handle_heartbeat(
                Heartbeat::new(node("node1"), NodeConnectionState::Connecting)
                    .with_fingerprint("abc"),
            )
            .unwrap();
        assert_eq!(status.state, NodeConnectionState::Connected);
        assert_eq!(coordinator.cluster_fingerprint().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_mismatched_fingerprint_stays_connecting() {
        let coordinator = coordinator();
        coordinator
            .handle_heartbeat(
                Heartbeat::new(node("node1"), NodeConnectionState::Connecting)
                    .with_fingerprint("abc"),
            )
            .unwrap();

        let status = coordinator
            .handle_heartbeat(
                Heartbeat::new(node("node2"), NodeConnectionState::Connecting)
                    .with_fingerprint("xyz"),
            )
            .unwrap();
        assert_eq!(status.state, NodeConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let coordinator = coordinator();
        connect(&coordinator, "node1");

        let status = coordinator
            .disconnect("node1", DisconnectionCode::UserDisconnected, "maintenance")
            .unwrap();
        assert_eq!(status.state, NodeConnectionState::Disconnected);
        assert_eq!(status.explanation.as_deref(), Some("maintenance"));

        let again = coordinator
            .disconnect("node1", DisconnectionCode::UserDisconnected, "maintenance")
            .unwrap();
        assert_eq!(again.update_id, status.update_id);
    }

    #[tokio::test]
    async fn test_offload_requires_offloading_first() {
        let coordinator = coordinator();
        connect(&coordinator, "node1");

        let err = coordinator.finish_offload("node1").unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));

        coordinator
            .begin_offload("node1", OffloadCode::Offloaded, "decommission")
            .unwrap();
        let status = coordinator.finish_offload("node1").unwrap();
        assert_eq!(status.state, NodeConnectionState::Offloaded);
        assert_eq!(status.offload_code, Some(OffloadCode::Offloaded));
    }

    #[tokio::test]
    async fn test_remove_rejected_while_connected_or_offloading() {
        let coordinator = coordinator();
        connect(&coordinator, "node1");

        assert!(matches!(
            coordinator.remove_node("node1", "test"),
            Err(Error::IllegalState(_))
        ));

        coordinator
            .begin_offload("node1", OffloadCode::Offloaded, "decommission")
            .unwrap();
        assert!(coordinator.remove_node("node1", "test").is_err());

        coordinator.finish_offload("node1").unwrap();
        coordinator.remove_node("node1", "test").unwrap();
        assert!(coordinator.get_status("node1").is_none());

        // Absent nodes are removed silently
        coordinator.remove_node("node1", "test").unwrap();
    }

    #[tokio::test]
    async fn test_failed_offload_returns_to_disconnected() {
        let coordinator = coordinator();
        connect(&coordinator, "node1");
        coordinator
            .begin_offload("node1", OffloadCode::Offloaded, "decommission")
            .unwrap();

        let status = coordinator.fail_offload("node1", "engine refused").unwrap();
        assert_eq!(status.state, NodeConnectionState::Disconnected);
        assert_eq!(status.offload_code, Some(OffloadCode::OffloadFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_disconnects_silent_nodes() {
        let coordinator = coordinator();
        connect(&coordinator, "node1");
        connect(&coordinator, "node2");

        tokio::time::advance(coordinator.config().node_timeout / 2).await;
        coordinator
            .handle_heartbeat(Heartbeat::new(node("node2"), NodeConnectionState::Connected))
            .unwrap();
        let half_timeout = coordinator.config().node_timeout / 2;
        tokio::time::advance(half_timeout + std::time::Duration::from_secs(1)).await;

        coordinator.check_heartbeats();

        let silent = coordinator.get_status("node1").unwrap();
        assert_eq!(silent.state, NodeConnectionState::Disconnected);
        assert_eq!(silent.disconnection_code, Some(DisconnectionCode::LackOfHeartbeat));
        assert_eq!(
            coordinator.get_status("node2").unwrap().state,
            NodeConnectionState::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_completes_unacknowledged_disconnect() {
        let coordinator = coordinator();
        connect(&coordinator, "node1");
        coordinator
            .begin_disconnect("node1", DisconnectionCode::NodeShutdown, "shutting down")
            .unwrap();

        coordinator.check_heartbeats();
        assert_eq!(
            coordinator.get_status("node1").unwrap().state,
            NodeConnectionState::Disconnecting
        );

        let past_timeout = coordinator.config().node_timeout + std::time::Duration::from_secs(1);
        tokio::time::advance(past_timeout).await;
        coordinator.check_heartbeats();

        let status = coordinator.get_status("node1").unwrap();
        assert_eq!(status.state, NodeConnectionState::Disconnected);
        assert_eq!(status.disconnection_code, Some(DisconnectionCode::NodeShutdown));
        assert_eq!(status.explanation.as_deref(), Some("shutting down"));
    }
}
