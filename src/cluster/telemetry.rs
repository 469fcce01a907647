//! Cluster coordination telemetry instruments and recording helpers.

use super::connection::NodeConnectionState;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct ClusterInstruments {
    state_transitions: Counter<u64>,
    node_removals: Counter<u64>,
    replication_requests: Counter<u64>,
    replication_duration_seconds: Histogram<f64>,
    node_responses: Counter<u64>,
    node_response_latency_seconds: Histogram<f64>,
    problematic_nodes: Histogram<u64>,
    lifecycle_requests: Counter<u64>,
    decommission_phases: Counter<u64>,
}

fn instruments() -> &'static ClusterInstruments {
    static INSTRUMENTS: OnceLock<ClusterInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("flowmesh.cluster");
        ClusterInstruments {
            state_transitions: meter
                .u64_counter("flowmesh.cluster.state_transitions")
                .with_description("Node connection state transitions")
                .init(),
            node_removals: meter
                .u64_counter("flowmesh.cluster.node_removals")
                .with_description("Nodes removed from the cluster by final state")
                .init(),
            replication_requests: meter
                .u64_counter("flowmesh.cluster.replication.requests")
                .with_description("Replicated cluster requests by outcome")
                .init(),
            replication_duration_seconds: meter
                .f64_histogram("flowmesh.cluster.replication.duration")
                .with_description("Fan-out wall time per replicated request")
                .with_unit("s")
                .init(),
            node_responses: meter
                .u64_counter("flowmesh.cluster.replication.node_responses")
                .with_description("Per-node replication outcomes")
                .init(),
            node_response_latency_seconds: meter
                .f64_histogram("flowmesh.cluster.replication.node_latency")
                .with_description("Per-node response latency")
                .with_unit("s")
                .init(),
            problematic_nodes: meter
                .u64_histogram("flowmesh.cluster.replication.problematic_nodes")
                .with_description("Nodes that failed to answer a replicated request")
                .init(),
            lifecycle_requests: meter
                .u64_counter("flowmesh.cluster.lifecycle.requests")
                .with_description("Disconnect and offload requests by outcome")
                .init(),
            decommission_phases: meter
                .u64_counter("flowmesh.cluster.decommission.phases")
                .with_description("Decommission phases entered")
                .init(),
        }
    })
}

pub fn record_transition(from: Option<NodeConnectionState>, to: NodeConnectionState) {
    let from = from.map(|state| state.as_str()).unwrap_or("NONE");
    instruments().state_transitions.add(
        1,
        &[KeyValue::new("from", from), KeyValue::new("to", to.as_str())],
    );
}

pub fn record_removal(state: NodeConnectionState) {
    instruments()
        .node_removals
        .add(1, &[KeyValue::new("state", state.as_str())]);
}

pub struct ReplicationMetrics {
    pub outcome: &'static str,
    pub mutable: bool,
    pub duration_seconds: f64,
    pub problematic_nodes: u64,
}

pub fn record_replication(metrics: ReplicationMetrics) {
    let i = instruments();
    let attrs = [
        KeyValue::new("outcome", metrics.outcome),
        KeyValue::new("mutable", metrics.mutable),
    ];
    i.replication_requests.add(1, &attrs);
    i.replication_duration_seconds
        .record(metrics.duration_seconds, &attrs);
    i.problematic_nodes.record(metrics.problematic_nodes, &attrs);
}

pub fn record_node_response(outcome: &'static str, latency_seconds: f64) {
    let i = instruments();
    let attrs = [KeyValue::new("outcome", outcome)];
    i.node_responses.add(1, &attrs);
    i.node_response_latency_seconds.record(latency_seconds, &attrs);
}

pub fn record_lifecycle_request(kind: &'static str, outcome: &'static str) {
    instruments().lifecycle_requests.add(
        1,
        &[KeyValue::new("kind", kind), KeyValue::new("outcome", outcome)],
    );
}

pub fn record_decommission_phase(phase: &'static str) {
    instruments()
        .decommission_phases
        .add(1, &[KeyValue::new("phase", phase)]);
}
