//! Cluster request replication
//!
//! A client operation entering any node is sent to every connected node;
//! each node runs it locally and answers with a status-coded entity. The
//! collected answers are handed to [`crate::reconcile`] to produce a single
//! response.

pub mod operation;
pub mod replicator;
pub mod response;

pub use operation::{ClusterOperation, Method};
pub use replicator::RequestReplicator;
pub use response::{FailureKind, NodeFailure, NodeResponse, ReplicationOutcome};
