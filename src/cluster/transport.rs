//! Point-to-point peer transport
//!
//! The control plane never opens connections itself. It hands a
//! [`PeerRequest`] to a [`NodeTransport`] and gets back a reply or a failure.
//! [`InProcessTransport`] routes requests to handlers living in the same
//! process, for single-node deployments and tests.

use super::connection::{DisconnectionCode, OffloadCode};
use super::node::NodeIdentifier;
use crate::replication::ClusterOperation;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Message sent to a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerRequest {
    /// Execute a replicated client operation locally
    Replicate(ClusterOperation),
    /// The coordinator has disconnected the node
    Disconnect {
        code: DisconnectionCode,
        explanation: String,
    },
    /// The node must start evacuating its data and work
    Offload { code: OffloadCode, explanation: String },
}

impl PeerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Replicate(_) => "replicate",
            Self::Disconnect { .. } => "disconnect",
            Self::Offload { .. } => "offload",
        }
    }
}

/// Status-coded answer from a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReply {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl PeerReply {
    pub fn new(status: u16, body: Option<serde_json::Value>) -> Self {
        Self { status, body }
    }

    pub fn ok(body: serde_json::Value) -> Self {
        Self::new(200, Some(body))
    }

    pub fn accepted() -> Self {
        Self::new(202, None)
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            status,
            Some(serde_json::json!({ "message": message.into() })),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `message` field of the body, if any
    pub fn message(&self) -> Option<&str> {
        self.body.as_ref()?.get("message")?.as_str()
    }
}

/// Outbound call to a peer node
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Deliver `request` to `node`. Timeouts are applied by callers.
    async fn send(&self, node: &NodeIdentifier, request: &PeerRequest) -> Result<PeerReply>;
}

/// Receiving end of a peer request
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(&self, request: &PeerRequest) -> Result<PeerReply>;
}

/// Transport that dispatches to handlers registered in this process
#[derive(Default)]
pub struct InProcessTransport {
    handlers: DashMap<String, Arc<dyn NodeHandler>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests for `node_id` to `handler`, replacing any previous route
    pub fn register(&self, node_id: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_id.into(), handler);
    }

    /// Drop the route for `node_id`; later sends fail as unreachable
    pub fn unregister(&self, node_id: &str) {
        self.handlers.remove(node_id);
    }
}

#[async_trait]
impl NodeTransport for InProcessTransport {
    async fn send(&self, node: &NodeIdentifier, request: &PeerRequest) -> Result<PeerReply> {
        // Clone the handler out so no map shard lock is held across the await
        let handler = self
            .handlers
            .get(node.id())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::transport(node.id(), "no route to node"))?;

        debug!(node_id = %node.id(), kind = request.kind(), "Dispatching in-process peer request");
        handler.handle(request).await
    }
}
