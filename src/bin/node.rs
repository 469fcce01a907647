//! flowmesh node binary
//!
//! Runs one cluster node together with any number of simulated peers in the
//! same process, all wired through the in-process transport. Useful for
//! watching the connection lifecycle, replication and decommissioning end
//! to end.

use flowmesh::cluster::{
    AtomicProcessingSignal, ClusterCoordinator, Heartbeat, InProcessTransport, LocalNodeHandler,
    NodeConnectionState, NodeIdentifier, OffloadAgent, OperationHandler, PeerReply,
};
use flowmesh::config::ComponentFactory;
use flowmesh::replication::ClusterOperation;
use flowmesh::telemetry::Telemetry;
use flowmesh::Result;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// flowmesh cluster node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster-unique ID of this node
    #[arg(long, env = "FLOWMESH_NODE_ID", default_value = "node-1")]
    node_id: String,

    /// Address clients use to reach this node
    #[arg(long, env = "FLOWMESH_API_ADDRESS", default_value = "127.0.0.1")]
    api_address: String,

    /// API port
    #[arg(long, env = "FLOWMESH_API_PORT", default_value = "8080")]
    api_port: u16,

    /// Cluster fingerprint announced in heartbeats
    #[arg(long, env = "FLOWMESH_CLUSTER_FINGERPRINT", default_value = "flowmesh-default")]
    fingerprint: String,

    /// Number of simulated peer nodes started in this process
    #[arg(long, default_value = "2")]
    simulated_peers: usize,

    /// Heartbeat interval in milliseconds
    #[arg(long, env = "FLOWMESH_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: Option<u64>,

    /// Per-node replication timeout in milliseconds
    #[arg(long, env = "FLOWMESH_REPLICATION_TIMEOUT_MS")]
    replication_timeout_ms: Option<u64>,

    /// Decommission this node once the cluster has formed
    #[arg(long)]
    decommission: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Answers replicated operations with this node's view of the flow
struct DemoOperations {
    node: NodeIdentifier,
    coordinator: Arc<ClusterCoordinator>,
}

#[async_trait]
impl OperationHandler for DemoOperations {
    async fn execute(&self, operation: &ClusterOperation) -> Result<PeerReply> {
        let segments = operation.path_segments();
        let reply = match segments.as_slice() {
            ["cluster", "summary"] => {
                let summary = self.coordinator.summary();
                PeerReply::ok(json!({
                    "node": self.node.id(),
                    "connectedNodes": summary.connected_display(),
                    "summary": summary,
                }))
            }
            ["flow", "process-groups", id] => PeerReply::ok(json!({
                "id": id,
                "permissions": { "canRead": true, "canWrite": true },
                "component": { "id": id, "name": "root" },
                "status": {
                    "flowFilesQueued": 1,
                    "bytesQueued": self.node.api_port() as u64,
                    "activeThreadCount": 1
                }
            })),
            _ => PeerReply::error(404, format!("no resource at {}", operation.path)),
        };
        Ok(reply)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_node("flowmesh-node", &args.node_id, &args.log_level)?;

    info!("Starting flowmesh node");

    let mut config = ComponentFactory::cluster_config_from_env()?;
    if let Some(ms) = args.heartbeat_interval_ms {
        config.heartbeat_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(ms) = args.replication_timeout_ms {
        config.replication_timeout = Duration::from_millis(ms);
    }
    let heartbeat_interval = config.heartbeat_interval;
    let offload_poll_interval = config.offload_poll_interval;

    let local = NodeIdentifier::new(&args.node_id, &args.api_address, args.api_port);
    let transport = Arc::new(InProcessTransport::new());
    let components = ComponentFactory::build(config, local.clone(), transport.clone());
    let coordinator = Arc::clone(&components.coordinator);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });
    let mut offload_agents = Vec::new();

    let local_node = ComponentFactory::local_node(
        &components,
        Arc::new(AtomicProcessingSignal::new(false)),
        Arc::new(DemoOperations {
            node: local.clone(),
            coordinator: Arc::clone(&coordinator),
        }),
    )?;
    transport.register(local.id(), local_node.handler.clone());
    offload_agents.push(Arc::clone(&local_node.offload));

    let mut nodes = vec![local.clone()];
    for i in 1..=args.simulated_peers {
        let peer = NodeIdentifier::new(
            format!("{}-peer-{}", args.node_id, i),
            &args.api_address,
            args.api_port.saturating_add(i as u16),
        );
        let offload = Arc::new(OffloadAgent::new(
            peer.clone(),
            Arc::new(AtomicProcessingSignal::new(false)),
            coordinator.clone(),
            offload_poll_interval,
        ));
        let handler = LocalNodeHandler::new(
            peer.clone(),
            Arc::clone(&coordinator),
            Arc::new(DemoOperations {
                node: peer.clone(),
                coordinator: Arc::clone(&coordinator),
            }),
            Arc::clone(&offload),
        );
        transport.register(peer.id(), Arc::new(handler));
        offload_agents.push(offload);
        nodes.push(peer);
    }

    let local_heartbeats = shutdown.child_token();
    for node in &nodes {
        let cancel = if node.id() == local.id() {
            local_heartbeats.clone()
        } else {
            shutdown.child_token()
        };
        tokio::spawn(heartbeat_loop(
            Arc::clone(&coordinator),
            node.clone(),
            args.fingerprint.clone(),
            heartbeat_interval,
            cancel,
        ));
    }

    let monitor = Arc::clone(&coordinator);
    let monitor_cancel = shutdown.child_token();
    tokio::spawn(async move { monitor.run_heartbeat_monitor(monitor_cancel).await });

    // Let every node finish its handshake
    tokio::time::sleep(heartbeat_interval * 2).await;
    let summary = coordinator.summary();
    info!(
        connected = %summary.connected_display(),
        "Cluster formed"
    );

    match components
        .replicator
        .execute(&ClusterOperation::get("/flow/process-groups/root"))
        .await
    {
        Ok(merged) => info!(
            status = merged.status,
            problematic_nodes = merged.problematic_nodes.len(),
            entity = %merged.entity.unwrap_or_default(),
            "Replicated flow status"
        ),
        Err(e) => warn!("Replicated flow status failed: {}", e),
    }

    if args.decommission {
        let decommissioner = Arc::clone(&components.decommissioner);
        let cancel = shutdown.child_token();
        match decommissioner.decommission(&cancel).await {
            Ok(()) => {
                local_heartbeats.cancel();
                info!(node_id = %local.id(), "Node decommissioned");
            }
            Err(e) => error!(node_id = %local.id(), "Decommission failed: {}", e),
        }
    }

    info!(node_id = %local.id(), "Node running, waiting for shutdown signal");
    shutdown.cancelled().await;

    info!("Node shutting down");
    for agent in offload_agents {
        agent.shutdown();
    }

    Ok(())
}

/// Report `node`'s view of its own state until cancelled or removed.
async fn heartbeat_loop(
    coordinator: Arc<ClusterCoordinator>,
    node: NodeIdentifier,
    fingerprint: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut registered = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let reported = match coordinator.get_status(node.id()) {
            Some(status) => {
                registered = true;
                status.state
            }
            None if registered => {
                info!(node_id = %node.id(), "Node removed from cluster, stopping heartbeats");
                return;
            }
            None => NodeConnectionState::Connecting,
        };

        let heartbeat =
            Heartbeat::new(node.clone(), reported).with_fingerprint(fingerprint.clone());
        if let Err(e) = coordinator.handle_heartbeat(heartbeat) {
            warn!(node_id = %node.id(), "Heartbeat rejected: {}", e);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
