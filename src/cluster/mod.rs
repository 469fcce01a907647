//! Cluster coordination for flowmesh
//!
//! Tracks the connection state of every node, moves nodes through the
//! connect / disconnect / offload lifecycle and drives decommissioning of
//! the local node. Replicating client operations across the connected nodes
//! lives in [`crate::replication`].

pub mod connection;
pub mod coordinator;
pub mod decommission;
pub mod dispatcher;
pub mod local_node;
pub mod node;
pub mod node_registry;
pub mod offload;
pub mod retry;
pub mod telemetry;
pub mod transport;

pub use connection::{DisconnectionCode, NodeConnectionState, NodeConnectionStatus, OffloadCode};
pub use coordinator::{ClusterCoordinator, Heartbeat};
pub use decommission::{DecommissionConfig, NodeDecommissioner};
pub use dispatcher::{ClusterLifecycleDispatcher, LifecycleDispatcher};
pub use local_node::{LocalNodeHandler, OperationHandler};
pub use node::NodeIdentifier;
pub use node_registry::{ClusterSummary, NodeRegistry};
pub use offload::{AtomicProcessingSignal, HeartbeatSink, OffloadAgent, ProcessingSignal};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use transport::{InProcessTransport, NodeHandler, NodeTransport, PeerReply, PeerRequest};

use std::time::Duration;

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Interval between heartbeats and heartbeat checks
    pub heartbeat_interval: Duration,
    /// Connected nodes silent for longer are disconnected
    pub node_timeout: Duration,
    /// Connecting nodes that never finish the handshake are disconnected after this
    pub connection_timeout: Duration,
    /// Per-node bound on a replicated request
    pub replication_timeout: Duration,
    /// Bound on each disconnect / offload notice sent to a node
    pub lifecycle_request_timeout: Duration,
    /// Registry poll interval while decommissioning
    pub decommission_poll_interval: Duration,
    /// Engine poll interval while offloading
    pub offload_poll_interval: Duration,
    pub retry_base_backoff: Duration,
    pub retry_max_backoff: Duration,
    /// Accept mutating requests while nodes are joining or leaving
    pub allow_mutations_while_unstable: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            node_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            replication_timeout: Duration::from_secs(30),
            lifecycle_request_timeout: Duration::from_secs(10),
            decommission_poll_interval: Duration::from_secs(3),
            offload_poll_interval: Duration::from_secs(1),
            retry_base_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(30),
            allow_mutations_while_unstable: false,
        }
    }
}

impl ClusterConfig {
    /// Unbounded retry policy for lifecycle requests
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded(self.retry_base_backoff, self.retry_max_backoff)
    }

    pub fn decommission_config(&self) -> DecommissionConfig {
        DecommissionConfig {
            poll_interval: self.decommission_poll_interval,
            retry: self.retry_policy(),
        }
    }
}
