//! Node connection state machine
//!
//! A node identity moves through `Connecting -> Connected -> Disconnecting ->
//! Disconnected`, or along the decommission path `Offloading -> Offloaded`.
//! Removal from the registry is not a state: it is only legal once the node
//! is `Disconnected` or `Offloaded`.

use super::node::NodeIdentifier;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a node's cluster membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeConnectionState {
    /// Node asked to join and has not completed the handshake
    Connecting,
    /// Node is a full cluster member
    Connected,
    /// Node is being disconnected
    Disconnecting,
    /// Node is out of the cluster but may reconnect
    Disconnected,
    /// Node is evacuating its local data and work
    Offloading,
    /// Evacuation finished; node is safe to remove
    Offloaded,
}

impl NodeConnectionState {
    pub const ALL: [NodeConnectionState; 6] = [
        NodeConnectionState::Connecting,
        NodeConnectionState::Connected,
        NodeConnectionState::Disconnecting,
        NodeConnectionState::Disconnected,
        NodeConnectionState::Offloading,
        NodeConnectionState::Offloaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Offloading => "OFFLOADING",
            Self::Offloaded => "OFFLOADED",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Re-entering the current state is always legal so that transition
    /// requests stay idempotent.
    pub fn can_transition_to(self, next: NodeConnectionState) -> bool {
        use NodeConnectionState::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Connected, Offloading)
                | (Disconnecting, Disconnected)
                | (Disconnected, Connecting)
                | (Disconnected, Offloading)
                | (Offloading, Offloaded)
                | (Offloading, Disconnected)
                | (Offloaded, Connecting)
        )
    }

    /// Whether a node in this state may be deleted from the registry
    pub fn is_removable(self) -> bool {
        matches!(self, Self::Disconnected | Self::Offloaded)
    }

    /// Whether the node is evacuating or has evacuated
    pub fn is_offload_phase(self) -> bool {
        matches!(self, Self::Offloading | Self::Offloaded)
    }

    /// Whether the node is between stable states
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl fmt::Display for NodeConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a node was disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectionCode {
    NotYetConnected,
    StartupFailure,
    LackOfHeartbeat,
    ClusterStateMismatch,
    NodeShutdown,
    UserDisconnected,
    UnableToCommunicate,
    FailedToServiceRequest,
}

impl DisconnectionCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotYetConnected => "Has not yet connected to the cluster",
            Self::StartupFailure => "Node failed to start up properly",
            Self::LackOfHeartbeat => "Lack of heartbeat",
            Self::ClusterStateMismatch => {
                "Node's cluster state does not match the cluster's state"
            }
            Self::NodeShutdown => "Node was shut down",
            Self::UserDisconnected => "User disconnected node",
            Self::UnableToCommunicate => "Unable to communicate with node",
            Self::FailedToServiceRequest => "Failed to service request",
        }
    }
}

impl fmt::Display for DisconnectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Reason a node entered or left the offload path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OffloadCode {
    Offloaded,
    OffloadFailed,
}

impl OffloadCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Offloaded => "Node was offloaded due to user request",
            Self::OffloadFailed => "Node failed to offload its data",
        }
    }
}

impl fmt::Display for OffloadCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Connection status of one node.
///
/// Replaced as a whole on every transition; never edited in place.
/// `update_id` is stamped by the registry when the status is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnectionStatus {
    pub node: NodeIdentifier,
    pub state: NodeConnectionState,
    pub disconnection_code: Option<DisconnectionCode>,
    pub offload_code: Option<OffloadCode>,
    pub explanation: Option<String>,
    pub update_id: u64,
    pub updated_at: DateTime<Utc>,
}

impl NodeConnectionStatus {
    fn with_state(node: NodeIdentifier, state: NodeConnectionState) -> Self {
        Self {
            node,
            state,
            disconnection_code: None,
            offload_code: None,
            explanation: None,
            update_id: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn connecting(node: NodeIdentifier) -> Self {
        Self::with_state(node, NodeConnectionState::Connecting)
    }

    pub fn connected(node: NodeIdentifier) -> Self {
        Self::with_state(node, NodeConnectionState::Connected)
    }

    pub fn disconnecting(
        node: NodeIdentifier,
        code: DisconnectionCode,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            disconnection_code: Some(code),
            explanation: Some(explanation.into()),
            ..Self::with_state(node, NodeConnectionState::Disconnecting)
        }
    }

    pub fn disconnected(
        node: NodeIdentifier,
        code: DisconnectionCode,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            disconnection_code: Some(code),
            explanation: Some(explanation.into()),
            ..Self::with_state(node, NodeConnectionState::Disconnected)
        }
    }

    pub fn offloading(
        node: NodeIdentifier,
        code: OffloadCode,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            offload_code: Some(code),
            explanation: Some(explanation.into()),
            ..Self::with_state(node, NodeConnectionState::Offloading)
        }
    }

    pub fn offloaded(
        node: NodeIdentifier,
        code: OffloadCode,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            offload_code: Some(code),
            explanation: Some(explanation.into()),
            ..Self::with_state(node, NodeConnectionState::Offloaded)
        }
    }

    pub fn node_id(&self) -> &str {
        self.node.id()
    }

    /// Check that this status may be replaced by one in state `next`.
    pub fn validate_transition(&self, next: NodeConnectionState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::IllegalTransition {
                node_id: self.node.id().to_string(),
                from: self.state,
                to: next,
            })
        }
    }
}

impl fmt::Display for NodeConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is {}", self.node, self.state)?;
        if let Some(code) = self.disconnection_code {
            write!(f, " ({})", code)?;
        }
        if let Some(code) = self.offload_code {
            write!(f, " ({})", code)?;
        }
        if let Some(explanation) = &self.explanation {
            write!(f, ": {}", explanation)?;
        }
        Ok(())
    }
}
