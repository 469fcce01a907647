//! Error types for flowmesh

use crate::cluster::NodeConnectionState;
use std::fmt;
use std::time::Duration;

/// Result type alias for flowmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for flowmesh
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// The local node has not joined a cluster
    NotClustered,
    /// No status is registered for the node
    NodeNotFound(String),
    /// The requested connection state transition is not legal
    IllegalTransition {
        node_id: String,
        from: NodeConnectionState,
        to: NodeConnectionState,
    },
    /// A workflow observed a connection state that contradicts its progress
    IllegalState(String),
    /// A mutating request reached a node that is offloading or offloaded
    MutableRequestWhileOffloaded { node_id: String },
    /// The cluster is not stable enough to accept mutating requests
    IllegalClusterState(String),
    /// No node is currently connected
    NoConnectedNodes,
    /// Peer transport failure
    Transport { node_id: String, message: String },
    /// A bounded call did not complete in time
    Timeout { operation: String, after: Duration },
    /// The peer answered but refused the request
    Rejected {
        node_id: String,
        status: u16,
        message: String,
    },
    /// Every node failed to answer a replicated request
    AllNodesFailed { request_id: String, failures: usize },
    /// A decommission is already running on this node
    DecommissionInProgress,
    /// The operation was cancelled cooperatively
    Cancelled,
    /// Too many retries
    TooManyRetries { attempts: u32 },
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether the failure may clear up on its own and the call is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Timeout { .. } => true,
            // The peer is up but could not serve the request right now
            Error::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn transport(node_id: &str, message: impl Into<String>) -> Self {
        Error::Transport {
            node_id: node_id.to_string(),
            message: message.into(),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::NotClustered => write!(f, "Node is not part of a cluster"),
            Error::NodeNotFound(node_id) => write!(f, "Node not found: {}", node_id),
            Error::IllegalTransition { node_id, from, to } => write!(
                f,
                "Illegal state transition for node {}: {} -> {}",
                node_id, from, to
            ),
            Error::IllegalState(msg) => write!(f, "Illegal node state: {}", msg),
            Error::MutableRequestWhileOffloaded { node_id } => write!(
                f,
                "Node {} is offloading or offloaded and cannot accept mutable requests",
                node_id
            ),
            Error::IllegalClusterState(msg) => write!(f, "Illegal cluster state: {}", msg),
            Error::NoConnectedNodes => write!(f, "No connected nodes available"),
            Error::Transport { node_id, message } => {
                write!(f, "Transport error talking to node {}: {}", node_id, message)
            }
            Error::Timeout { operation, after } => write!(
                f,
                "Operation timed out after {}ms: {}",
                after.as_millis(),
                operation
            ),
            Error::Rejected {
                node_id,
                status,
                message,
            } => write!(
                f,
                "Node {} rejected the request with status {}: {}",
                node_id, status, message
            ),
            Error::AllNodesFailed {
                request_id,
                failures,
            } => write!(
                f,
                "Request {} failed on all {} targeted nodes",
                request_id, failures
            ),
            Error::DecommissionInProgress => {
                write!(f, "A decommission of this node is already in progress")
            }
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::TooManyRetries { attempts } => write!(
                f,
                "Too many retries: operation failed after {} attempts",
                attempts
            ),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
