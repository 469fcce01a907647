//! # flowmesh
//!
//! Cluster coordination core for a distributed dataflow engine.
//!
//! Every node runs the same flow. flowmesh keeps track of which nodes are
//! part of the cluster, moves them through the connection lifecycle, and
//! makes a client request entering any node behave like a request to the
//! whole cluster.
//!
//! ## Components
//!
//! - **Node registry**: the authoritative connection state of every node,
//!   updated by atomic replace
//! - **Coordinator**: heartbeats, handshake and the heartbeat monitor
//! - **Lifecycle dispatcher**: disconnect, offload and removal requests
//! - **Decommissioner**: disconnect, offload, wait, remove for the local node
//! - **Replicator**: parallel fan-out of an operation to connected nodes
//! - **Reconciler**: merges per-node answers into one response

pub mod cluster;
pub mod config;
pub mod reconcile;
pub mod replication;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{
        ClusterConfig, ClusterCoordinator, DisconnectionCode, Heartbeat, NodeConnectionState,
        NodeConnectionStatus, NodeDecommissioner, NodeIdentifier, NodeRegistry, OffloadCode,
    };
    pub use crate::config::{ClusterComponents, ComponentFactory};
    pub use crate::reconcile::{MergedResult, ResponseReconciler};
    pub use crate::replication::{ClusterOperation, Method, RequestReplicator};
    pub use crate::{Error, Result};
}
