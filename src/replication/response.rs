//! Per-node results of a replicated operation

use crate::cluster::NodeIdentifier;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// One node's answer to a replicated operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub node: NodeIdentifier,
    pub status: u16,
    pub entity: Option<serde_json::Value>,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    pub request_id: Uuid,
}

impl NodeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Why a node produced no response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// No answer within the per-node bound
    Timeout,
    /// The node could not be reached
    Transport,
    /// The node refused to execute the operation
    Refused,
}

/// A node that did not answer a replicated operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailure {
    pub node: NodeIdentifier,
    pub kind: FailureKind,
    pub message: String,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
}

/// Everything collected for one replicated operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationOutcome {
    pub request_id: Uuid,
    /// Responses ordered by node ID
    pub responses: Vec<NodeResponse>,
    /// Failures ordered by node ID
    pub failures: Vec<NodeFailure>,
}

impl ReplicationOutcome {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            responses: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.responses.len() + self.failures.len()
    }

    pub fn is_total_failure(&self) -> bool {
        self.responses.is_empty()
    }

    pub(crate) fn sort(&mut self) {
        self.responses.sort_by(|a, b| a.node.id().cmp(b.node.id()));
        self.failures.sort_by(|a, b| a.node.id().cmp(b.node.id()));
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
