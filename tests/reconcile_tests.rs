//! Integration tests for response reconciliation
//!
//! Feeds hand-built replication outcomes through the reconciler and checks
//! status precedence, permission intersection, statistic sums, nested
//! component matching and failure handling.

use flowmesh::cluster::NodeIdentifier;
use flowmesh::reconcile::{
    EntityMerger, MergerRegistry, NodeEntity, ResourceKind, ResponseReconciler,
};
use flowmesh::replication::{
    ClusterOperation, FailureKind, NodeFailure, NodeResponse, ReplicationOutcome,
};
use flowmesh::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn node(id: &str) -> NodeIdentifier {
    NodeIdentifier::new(id, "10.0.0.1", 8443)
}

fn outcome(op: &ClusterOperation, answers: Vec<(&str, u16, Value)>) -> ReplicationOutcome {
    let mut outcome = ReplicationOutcome::new(op.request_id);
    for (id, status, entity) in answers {
        outcome.responses.push(NodeResponse {
            node: node(id),
            status,
            entity: Some(entity),
            latency: Duration::from_millis(3),
            request_id: op.request_id,
        });
    }
    outcome
}

fn processor(can_read: bool, can_write: bool, bytes_read: u64) -> Value {
    json!({
        "id": "p1",
        "revision": { "version": 7 },
        "permissions": { "canRead": can_read, "canWrite": can_write },
        "component": {
            "id": "p1",
            "name": "RouteOnAttribute",
            "config": { "schedulingPeriod": "1 sec" }
        },
        "status": { "bytesRead": bytes_read, "flowFilesIn": 2, "bytesIn": bytes_read }
    })
}

#[test]
fn test_permission_false_anywhere_wins() {
    let op = ClusterOperation::get("/processors/p1");
    let outcome = outcome(
        &op,
        vec![
            ("node1", 200, processor(true, true, 1)),
            ("node2", 200, processor(true, true, 1)),
            ("node3", 200, processor(false, true, 1)),
        ],
    );

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    let entity = merged.entity.unwrap();
    assert_eq!(entity["permissions"]["canRead"], false);
    assert_eq!(entity["permissions"]["canWrite"], true);
    // Without read access the descriptive snapshot is withheld
    assert!(entity.get("component").is_none());
    assert_eq!(entity["status"]["bytesRead"], 3);
}

#[test]
fn test_forbidden_outranks_success() {
    let op = ClusterOperation::get("/processors/p1");
    let outcome = outcome(
        &op,
        vec![
            ("node1", 200, processor(true, true, 1)),
            ("node2", 403, json!({ "message": "Unable to view processor" })),
            ("node3", 200, processor(true, true, 1)),
        ],
    );

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    assert_eq!(merged.status, 403);
    assert_eq!(merged.entity.as_ref().unwrap()["message"], "Unable to view processor");
    assert!(!merged.has_warnings());
}

#[test]
fn test_status_precedence_order() {
    let cases: &[(&[u16], u16)] = &[
        (&[200, 401, 403], 403),
        (&[500, 401, 200], 401),
        (&[200, 200, 500], 500),
        (&[404, 502, 200], 502),
        (&[200, 409, 200], 409),
        (&[200, 201, 200], 200),
    ];

    for (statuses, expected) in cases {
        let op = ClusterOperation::get("/system-diagnostics");
        let answers = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                (
                    ["node1", "node2", "node3"][i],
                    *status,
                    json!({ "from": i }),
                )
            })
            .collect();
        let merged = ResponseReconciler::new()
            .reconcile(&op, outcome(&op, answers), None)
            .unwrap();
        assert_eq!(merged.status, *expected, "statuses {statuses:?}");
    }
}

#[test]
fn test_statistics_are_summed_and_redisplayed() {
    let op = ClusterOperation::get("/flow/process-groups/root");
    let group = |bytes: u64| {
        json!({
            "id": "root",
            "permissions": { "canRead": true, "canWrite": true },
            "component": { "name": "Root" },
            "status": { "flowFilesQueued": 1, "bytesQueued": bytes, "activeThreadCount": 2 }
        })
    };
    let outcome = outcome(
        &op,
        vec![
            ("node1", 200, group(300)),
            ("node2", 200, group(100)),
            ("node3", 200, group(500)),
        ],
    );

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    let status = &merged.entity.as_ref().unwrap()["status"];
    assert_eq!(status["bytesQueued"], 900);
    assert_eq!(status["flowFilesQueued"], 3);
    assert_eq!(status["activeThreadCount"], 6);
    assert_eq!(status["queued"], "3 (900 bytes)");
}

#[test]
fn test_nested_children_merge_by_identity() {
    let op = ClusterOperation::get("/flow/process-groups/root");
    let group = |children: Value| {
        json!({
            "id": "root",
            "permissions": { "canRead": true, "canWrite": true },
            "component": { "name": "Root" },
            "status": { "bytesRead": 1 },
            "children": children
        })
    };
    let child = |id: &str, can_read: bool, bytes: u64| {
        json!({
            "id": id,
            "permissions": { "canRead": can_read, "canWrite": true },
            "component": { "name": id },
            "status": { "bytesRead": bytes }
        })
    };

    let outcome = outcome(
        &op,
        vec![
            (
                "node1",
                200,
                group(json!([child("ingest", true, 10), child("route", true, 4)])),
            ),
            (
                "node2",
                200,
                // same children in a different order
                group(json!([child("route", false, 6), child("ingest", true, 20)])),
            ),
            ("node3", 200, group(json!([child("ingest", true, 30)]))),
        ],
    );

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    let entity = merged.entity.unwrap();
    let children = entity["children"].as_array().unwrap();
    assert_eq!(children.len(), 2);

    assert_eq!(children[0]["id"], "ingest");
    assert_eq!(children[0]["status"]["bytesRead"], 60);
    assert_eq!(children[0]["status"]["read"], "60 bytes");
    assert_eq!(children[0]["component"]["name"], "ingest");

    // Missing on node3 and unreadable on node2
    assert_eq!(children[1]["id"], "route");
    assert_eq!(children[1]["status"]["bytesRead"], 10);
    assert_eq!(children[1]["permissions"]["canRead"], false);
    assert_eq!(children[1]["permissions"]["canWrite"], false);
    assert!(children[1].get("component").is_none());

    // The parent's own status is summed independently of its children
    assert_eq!(entity["status"]["bytesRead"], 3);
}

#[test]
fn test_counters_are_summed() {
    let op = ClusterOperation::get("/counters");
    let counters = |count: u64| {
        json!({
            "counters": [
                {
                    "id": "c1",
                    "context": "UpdateCounter (p1)",
                    "name": "records",
                    "valueCount": count
                }
            ]
        })
    };
    let outcome = outcome(
        &op,
        vec![("node1", 200, counters(1_200)), ("node2", 200, counters(800))],
    );

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    let entity = merged.entity.unwrap();
    assert_eq!(entity["counters"][0]["valueCount"], 2_000);
    assert_eq!(entity["counters"][0]["value"], "2,000");
}

#[test]
fn test_statistic_sums_saturate_instead_of_overflowing() {
    let op = ClusterOperation::get("/processors/p1");
    let outcome = outcome(
        &op,
        vec![
            ("node1", 200, processor(true, true, u64::MAX)),
            ("node2", 200, processor(true, true, 1)),
        ],
    );

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    let status = &merged.entity.as_ref().unwrap()["status"];
    assert_eq!(status["bytesRead"], u64::MAX);
    assert_eq!(status["bytesIn"], u64::MAX);
    assert_eq!(status["flowFilesIn"], 4);
}

#[test]
fn test_counter_sums_saturate_instead_of_overflowing() {
    let op = ClusterOperation::get("/counters");
    let counters = |count: u64| {
        json!({
            "counters": [
                {
                    "id": "c1",
                    "context": "UpdateCounter (p1)",
                    "name": "records",
                    "valueCount": count
                }
            ]
        })
    };
    let outcome = outcome(
        &op,
        vec![("node1", 200, counters(u64::MAX)), ("node2", 200, counters(5))],
    );

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    let entity = merged.entity.unwrap();
    assert_eq!(entity["counters"][0]["valueCount"], u64::MAX);
    assert_eq!(entity["counters"][0]["value"], "18,446,744,073,709,551,615");
}

#[test]
fn test_descriptive_fields_come_from_preferred_node() {
    let op = ClusterOperation::get("/processors/p1");
    let mut second = processor(true, true, 5);
    second["component"]["name"] = json!("RenamedOnNode2");
    let outcome = outcome(
        &op,
        vec![("node1", 200, processor(true, true, 5)), ("node2", 200, second)],
    );

    let preferred = node("node2");
    let merged = ResponseReconciler::new()
        .reconcile(&op, outcome, Some(&preferred))
        .unwrap();
    let entity = merged.entity.unwrap();
    assert_eq!(entity["component"]["name"], "RenamedOnNode2");
    assert_eq!(entity["revision"]["version"], 7);
    assert_eq!(entity["status"]["bytesRead"], 10);
}

#[test]
fn test_failures_are_reported_as_problematic_nodes() {
    let op = ClusterOperation::get("/processors/p1");
    let mut outcome = outcome(&op, vec![("node1", 200, processor(true, true, 5))]);
    outcome.failures.push(NodeFailure {
        node: node("node2"),
        kind: FailureKind::Timeout,
        message: "no response within 30000ms".to_string(),
        latency: Duration::from_secs(30),
    });

    let merged = ResponseReconciler::new().reconcile(&op, outcome, None).unwrap();
    assert_eq!(merged.status, 200);
    assert!(merged.has_warnings());
    assert_eq!(merged.problematic_nodes[0].node.id(), "node2");
    assert!(merged.problematic_nodes[0].reason.contains("no response"));
    assert_eq!(merged.entity.unwrap()["status"]["bytesRead"], 5);
}

#[test]
fn test_no_responses_is_a_total_failure() {
    let op = ClusterOperation::get("/processors/p1");
    let mut outcome = ReplicationOutcome::new(op.request_id);
    for id in ["node1", "node2"] {
        outcome.failures.push(NodeFailure {
            node: node(id),
            kind: FailureKind::Transport,
            message: "connection refused".to_string(),
            latency: Duration::from_millis(1),
        });
    }

    let result = ResponseReconciler::new().reconcile(&op, outcome, None);
    assert!(matches!(result, Err(Error::AllNodesFailed { failures: 2, .. })));
}

/// Reports how many nodes answered instead of merging
struct NodeCount;

impl EntityMerger for NodeCount {
    fn merge(&self, _base: NodeEntity<'_>, others: &[NodeEntity<'_>]) -> Result<Value> {
        Ok(json!({ "nodes": others.len() + 1 }))
    }
}

#[test]
fn test_custom_merger_can_be_registered() {
    let op = ClusterOperation::get("/system-diagnostics");
    let outcome = outcome(
        &op,
        vec![
            ("node1", 200, json!({})),
            ("node2", 200, json!({})),
            ("node3", 200, json!({})),
        ],
    );

    let mut registry = MergerRegistry::default();
    registry.register(ResourceKind::Generic, Arc::new(NodeCount));
    let merged = ResponseReconciler::with_registry(registry)
        .reconcile(&op, outcome, None)
        .unwrap();
    assert_eq!(merged.entity.unwrap()["nodes"], 3);
}
