//! Integration tests for cluster request replication
//!
//! Fans operations out over the in-process transport and checks which nodes
//! are targeted, how slow and dead nodes are recorded, and when mutating
//! requests are refused.

use async_trait::async_trait;
use flowmesh::cluster::{
    AtomicProcessingSignal, ClusterConfig, DisconnectionCode, Heartbeat, InProcessTransport,
    LocalNodeHandler, NodeConnectionState, NodeHandler, NodeIdentifier, OffloadAgent, OffloadCode,
    OperationHandler, PeerReply, PeerRequest,
};
use flowmesh::config::{ClusterComponents, ComponentFactory};
use flowmesh::reconcile::ResponseReconciler;
use flowmesh::replication::{ClusterOperation, FailureKind, Method, RequestReplicator};
use flowmesh::{Error, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn node(id: &str) -> NodeIdentifier {
    NodeIdentifier::new(id, "10.0.0.1", 8443)
}

/// Answers every replicated operation with a fixed reply
struct StaticNode {
    reply: PeerReply,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticNode {
    fn new(status: u16, body: Value) -> Arc<Self> {
        Arc::new(Self {
            reply: PeerReply::new(status, Some(body)),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: PeerReply::ok(json!({})),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NodeHandler for StaticNode {
    async fn handle(&self, _request: &PeerRequest) -> Result<PeerReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.reply.clone())
    }
}

fn process_group(bytes_queued: u64) -> Value {
    json!({
        "id": "root",
        "permissions": { "canRead": true, "canWrite": true },
        "component": { "id": "root", "name": "Ingest" },
        "status": { "flowFilesQueued": 1, "bytesQueued": bytes_queued }
    })
}

fn cluster(config: ClusterConfig, ids: &[&str]) -> (ClusterComponents, Arc<InProcessTransport>) {
    let transport = Arc::new(InProcessTransport::new());
    let components = ComponentFactory::build(config, node(ids[0]), transport.clone());
    for id in ids {
        components
            .coordinator
            .handle_heartbeat(Heartbeat::new(node(id), NodeConnectionState::Connecting))
            .unwrap();
    }
    (components, transport)
}

#[tokio::test]
async fn test_replicates_to_every_connected_node() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2", "node3"]);
    let handlers = [
        ("node1", StaticNode::new(200, process_group(300))),
        ("node2", StaticNode::new(200, process_group(100))),
        ("node3", StaticNode::new(200, process_group(500))),
    ];
    for (id, handler) in &handlers {
        transport.register(*id, handler.clone());
    }

    let outcome = components
        .replicator
        .replicate(&ClusterOperation::get("/flow/process-groups/root"))
        .await
        .unwrap();
    assert_eq!(outcome.responses.len(), 3);
    assert!(outcome.failures.is_empty());
    let ids: Vec<&str> = outcome.responses.iter().map(|r| r.node.id()).collect();
    assert_eq!(ids, vec!["node1", "node2", "node3"]);
    for (_, handler) in &handlers {
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_execute_merges_responses() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2", "node3"]);
    transport.register("node1", StaticNode::new(200, process_group(300)));
    transport.register("node2", StaticNode::new(200, process_group(100)));
    transport.register("node3", StaticNode::new(200, process_group(500)));

    let merged = components
        .replicator
        .execute(&ClusterOperation::get("/flow/process-groups/root"))
        .await
        .unwrap();

    assert_eq!(merged.status, 200);
    assert!(!merged.has_warnings());
    let entity = merged.entity.unwrap();
    assert_eq!(entity["status"]["bytesQueued"], 900);
    assert_eq!(entity["status"]["queued"], "3 (900 bytes)");
    assert_eq!(entity["component"]["name"], "Ingest");
}

#[tokio::test]
async fn test_slow_and_unreachable_nodes_are_recorded() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2", "node3"]);
    transport.register("node1", StaticNode::new(200, process_group(10)));
    transport.register("node2", StaticNode::slow(Duration::from_secs(10)));
    // node3 has no route

    let replicator = RequestReplicator::new(
        Arc::clone(&components.coordinator),
        transport.clone(),
        Arc::new(ResponseReconciler::new()),
    )
    .with_timeout(Duration::from_millis(50));

    let started = std::time::Instant::now();
    let outcome = replicator
        .replicate(&ClusterOperation::get("/flow/process-groups/root"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5), "slow node stalled the fan-out");

    assert_eq!(outcome.responses.len(), 1);
    assert_eq!(outcome.failures.len(), 2);
    assert_eq!(outcome.failures[0].node.id(), "node2");
    assert_eq!(outcome.failures[0].kind, FailureKind::Timeout);
    assert_eq!(outcome.failures[1].node.id(), "node3");
    assert_eq!(outcome.failures[1].kind, FailureKind::Transport);
}

#[tokio::test]
async fn test_partial_failure_degrades_to_warning() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2"]);
    transport.register("node1", StaticNode::new(200, process_group(42)));

    let merged = components
        .replicator
        .execute(&ClusterOperation::get("/flow/process-groups/root"))
        .await
        .unwrap();
    assert_eq!(merged.status, 200);
    assert_eq!(merged.entity.unwrap()["status"]["bytesQueued"], 42);
    assert_eq!(merged.problematic_nodes.len(), 1);
    assert_eq!(merged.problematic_nodes[0].node.id(), "node2");
}

#[tokio::test]
async fn test_total_failure_fails_the_operation() {
    let (components, _transport) = cluster(ClusterConfig::default(), &["node1", "node2"]);

    let result = components
        .replicator
        .execute(&ClusterOperation::get("/flow/process-groups/root"))
        .await;
    assert!(matches!(result, Err(Error::AllNodesFailed { failures: 2, .. })));
}

#[tokio::test]
async fn test_only_connected_nodes_are_targeted() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2", "node3"]);
    let handlers: Vec<_> = (0..3).map(|_| StaticNode::new(200, json!({}))).collect();
    for (id, handler) in ["node1", "node2", "node3"].iter().zip(&handlers) {
        transport.register(*id, handler.clone());
    }
    components
        .coordinator
        .disconnect("node2", DisconnectionCode::UserDisconnected, "maintenance")
        .unwrap();
    components
        .coordinator
        .begin_offload("node3", OffloadCode::Offloaded, "decommission")
        .unwrap();

    let outcome = components
        .replicator
        .replicate(&ClusterOperation::get("/system-diagnostics"))
        .await
        .unwrap();
    assert_eq!(outcome.node_count(), 1);
    assert_eq!(handlers[0].calls.load(Ordering::SeqCst), 1);
    assert_eq!(handlers[1].calls.load(Ordering::SeqCst), 0);
    assert_eq!(handlers[2].calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_connected_nodes() {
    let transport = Arc::new(InProcessTransport::new());
    let components = ComponentFactory::build(ClusterConfig::default(), node("node1"), transport);

    let result = components
        .replicator
        .replicate(&ClusterOperation::get("/system-diagnostics"))
        .await;
    assert!(matches!(result, Err(Error::NoConnectedNodes)));
}

#[tokio::test]
async fn test_mutation_refused_while_local_node_offloads() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2"]);
    transport.register("node1", StaticNode::new(200, json!({})));
    transport.register("node2", StaticNode::new(200, json!({})));
    components
        .coordinator
        .begin_offload("node1", OffloadCode::Offloaded, "decommission")
        .unwrap();

    let put = ClusterOperation::new(Method::Put, "/processors/p1")
        .with_payload(json!({ "state": "STOPPED" }));
    let result = components.replicator.replicate(&put).await;
    match result {
        Err(Error::MutableRequestWhileOffloaded { node_id }) => assert_eq!(node_id, "node1"),
        other => panic!("expected MutableRequestWhileOffloaded, got {other:?}"),
    }

    // Reads still go through
    let outcome = components
        .replicator
        .replicate(&ClusterOperation::get("/processors/p1"))
        .await
        .unwrap();
    assert_eq!(outcome.responses.len(), 1);
}

#[tokio::test]
async fn test_explicit_offloaded_target_refuses_mutation() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2"]);
    transport.register("node2", StaticNode::new(200, json!({})));
    components
        .coordinator
        .begin_offload("node2", OffloadCode::Offloaded, "decommission")
        .unwrap();

    let delete = ClusterOperation::new(Method::Delete, "/connections/c1");
    let result = components.replicator.replicate_to(&[node("node2")], &delete).await;
    assert!(matches!(
        result,
        Err(Error::MutableRequestWhileOffloaded { ref node_id }) if node_id == "node2"
    ));

    let outcome = components
        .replicator
        .replicate_to(&[node("node2")], &ClusterOperation::get("/connections/c1"))
        .await
        .unwrap();
    assert_eq!(outcome.responses.len(), 1);
}

#[tokio::test]
async fn test_mutation_refused_while_cluster_unstable() {
    let (components, transport) = cluster(ClusterConfig::default(), &["node1", "node2"]);
    transport.register("node1", StaticNode::new(200, json!({})));
    transport.register("node2", StaticNode::new(200, json!({})));
    components.coordinator.request_connection(node("node3")).unwrap();

    let post = ClusterOperation::new(Method::Post, "/process-groups/root/processors");
    let result = components.replicator.replicate(&post).await;
    assert!(matches!(result, Err(Error::IllegalClusterState(_))));

    let (permissive, transport) = cluster(
        ClusterConfig {
            allow_mutations_while_unstable: true,
            ..Default::default()
        },
        &["node1", "node2"],
    );
    transport.register("node1", StaticNode::new(201, json!({})));
    transport.register("node2", StaticNode::new(201, json!({})));
    permissive.coordinator.request_connection(node("node3")).unwrap();

    let outcome = permissive.replicator.replicate(&post).await.unwrap();
    assert_eq!(outcome.responses.len(), 2);
}

struct Echo;

#[async_trait]
impl OperationHandler for Echo {
    async fn execute(&self, operation: &ClusterOperation) -> Result<PeerReply> {
        Ok(PeerReply::ok(json!({ "path": operation.path })))
    }
}

#[tokio::test]
async fn test_offloading_node_refuses_replicated_mutation() {
    let (components, _transport) = cluster(ClusterConfig::default(), &["node1"]);
    let coordinator = Arc::clone(&components.coordinator);
    let offload = Arc::new(OffloadAgent::new(
        node("node1"),
        Arc::new(AtomicProcessingSignal::new(true)),
        coordinator.clone(),
        Duration::from_millis(5),
    ));
    let handler =
        LocalNodeHandler::new(node("node1"), coordinator.clone(), Arc::new(Echo), offload.clone());

    coordinator
        .begin_offload("node1", OffloadCode::Offloaded, "decommission")
        .unwrap();

    let put = PeerRequest::Replicate(ClusterOperation::new(Method::Put, "/processors/p1"));
    let err = handler.handle(&put).await.unwrap_err();
    assert!(matches!(err, Error::MutableRequestWhileOffloaded { .. }));

    let get = PeerRequest::Replicate(ClusterOperation::get("/processors/p1"));
    let reply = handler.handle(&get).await.unwrap();
    assert_eq!(reply.body.unwrap()["path"], "/processors/p1");
    offload.shutdown();
}
