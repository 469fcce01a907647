//! Component factory for environment-based configuration
//!
//! Reads cluster timing from `FLOWMESH_*` variables and wires the
//! coordinator, lifecycle dispatcher, replicator and decommissioner of one
//! node together.

use crate::cluster::{
    ClusterConfig, ClusterCoordinator, ClusterLifecycleDispatcher, LocalNodeHandler,
    NodeDecommissioner, NodeIdentifier, NodeRegistry, NodeTransport, OffloadAgent,
    OperationHandler, ProcessingSignal,
};
use crate::reconcile::ResponseReconciler;
use crate::replication::RequestReplicator;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything one node needs to take part in the cluster
pub struct ClusterComponents {
    pub registry: Arc<NodeRegistry>,
    pub coordinator: Arc<ClusterCoordinator>,
    pub dispatcher: Arc<ClusterLifecycleDispatcher>,
    pub reconciler: Arc<ResponseReconciler>,
    pub replicator: Arc<RequestReplicator>,
    pub decommissioner: Arc<NodeDecommissioner>,
}

/// Node-side handling of peer requests
pub struct LocalNode {
    pub offload: Arc<OffloadAgent>,
    pub handler: Arc<LocalNodeHandler>,
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Build the cluster configuration from the environment
    ///
    /// Environment variables (unset means the default):
    /// - FLOWMESH_HEARTBEAT_INTERVAL_MS (default: 5000)
    /// - FLOWMESH_NODE_TIMEOUT_SECS (default: 30)
    /// - FLOWMESH_CONNECTION_TIMEOUT_SECS (default: 60)
    /// - FLOWMESH_REPLICATION_TIMEOUT_MS (default: 30000)
    /// - FLOWMESH_LIFECYCLE_REQUEST_TIMEOUT_MS (default: 10000)
    /// - FLOWMESH_DECOMMISSION_POLL_INTERVAL_MS (default: 3000)
    /// - FLOWMESH_OFFLOAD_POLL_INTERVAL_MS (default: 1000)
    /// - FLOWMESH_RETRY_BASE_BACKOFF_MS (default: 500)
    /// - FLOWMESH_RETRY_MAX_BACKOFF_MS (default: 30000)
    /// - FLOWMESH_ALLOW_MUTATIONS_WHILE_UNSTABLE (default: false)
    pub fn cluster_config_from_env() -> Result<ClusterConfig> {
        Self::cluster_config_from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`cluster_config_from_env`](Self::cluster_config_from_env)
    /// with an explicit variable source
    pub fn cluster_config_from_lookup<F>(lookup: F) -> Result<ClusterConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ClusterConfig::default();
        let millis = |name: &str, default: Duration| -> Result<Duration> {
            Ok(parse_u64(name, lookup(name))?.map_or(default, Duration::from_millis))
        };
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            Ok(parse_u64(name, lookup(name))?.map_or(default, Duration::from_secs))
        };

        let config = ClusterConfig {
            heartbeat_interval: millis(
                "FLOWMESH_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            node_timeout: secs("FLOWMESH_NODE_TIMEOUT_SECS", defaults.node_timeout)?,
            connection_timeout: secs(
                "FLOWMESH_CONNECTION_TIMEOUT_SECS",
                defaults.connection_timeout,
            )?,
            replication_timeout: millis(
                "FLOWMESH_REPLICATION_TIMEOUT_MS",
                defaults.replication_timeout,
            )?,
            lifecycle_request_timeout: millis(
                "FLOWMESH_LIFECYCLE_REQUEST_TIMEOUT_MS",
                defaults.lifecycle_request_timeout,
            )?,
            decommission_poll_interval: millis(
                "FLOWMESH_DECOMMISSION_POLL_INTERVAL_MS",
                defaults.decommission_poll_interval,
            )?,
            offload_poll_interval: millis(
                "FLOWMESH_OFFLOAD_POLL_INTERVAL_MS",
                defaults.offload_poll_interval,
            )?,
            retry_base_backoff: millis(
                "FLOWMESH_RETRY_BASE_BACKOFF_MS",
                defaults.retry_base_backoff,
            )?,
            retry_max_backoff: millis("FLOWMESH_RETRY_MAX_BACKOFF_MS", defaults.retry_max_backoff)?,
            allow_mutations_while_unstable: parse_bool(
                "FLOWMESH_ALLOW_MUTATIONS_WHILE_UNSTABLE",
                lookup("FLOWMESH_ALLOW_MUTATIONS_WHILE_UNSTABLE"),
            )?
            .unwrap_or(defaults.allow_mutations_while_unstable),
        };

        if config.heartbeat_interval.is_zero() {
            return Err(Error::Config(
                "FLOWMESH_HEARTBEAT_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        if config.retry_base_backoff > config.retry_max_backoff {
            return Err(Error::Config(format!(
                "FLOWMESH_RETRY_BASE_BACKOFF_MS ({}) exceeds FLOWMESH_RETRY_MAX_BACKOFF_MS ({})",
                config.retry_base_backoff.as_millis(),
                config.retry_max_backoff.as_millis()
            )));
        }

        Ok(config)
    }

    /// Wire the cluster components of `local_node`
    pub fn build(
        config: ClusterConfig,
        local_node: NodeIdentifier,
        transport: Arc<dyn NodeTransport>,
    ) -> ClusterComponents {
        info!(
            node_id = %local_node.id(),
            api_endpoint = %local_node.api_endpoint(),
            heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
            replication_timeout_ms = config.replication_timeout.as_millis() as u64,
            "Building cluster components"
        );

        let registry = Arc::new(NodeRegistry::new());
        let decommission_config = config.decommission_config();
        let request_timeout = config.lifecycle_request_timeout;

        let coordinator = Arc::new(ClusterCoordinator::new(Arc::clone(&registry), config));
        coordinator.set_local_node_identifier(local_node);

        let dispatcher = Arc::new(ClusterLifecycleDispatcher::new(
            Arc::clone(&coordinator),
            Arc::clone(&transport),
            request_timeout,
        ));
        let reconciler = Arc::new(ResponseReconciler::new());
        let replicator = Arc::new(RequestReplicator::new(
            Arc::clone(&coordinator),
            transport,
            Arc::clone(&reconciler),
        ));
        let decommissioner = Arc::new(NodeDecommissioner::new(
            Arc::clone(&coordinator),
            dispatcher.clone(),
            decommission_config,
        ));

        ClusterComponents {
            registry,
            coordinator,
            dispatcher,
            reconciler,
            replicator,
            decommissioner,
        }
    }

    /// Build the handler that answers peer requests addressed to the local node
    pub fn local_node(
        components: &ClusterComponents,
        engine: Arc<dyn ProcessingSignal>,
        operations: Arc<dyn OperationHandler>,
    ) -> Result<LocalNode> {
        let node = components
            .coordinator
            .local_node_identifier()
            .ok_or(Error::NotClustered)?;

        let offload = Arc::new(OffloadAgent::new(
            node.clone(),
            engine,
            components.coordinator.clone(),
            components.coordinator.config().offload_poll_interval,
        ));
        let handler = Arc::new(LocalNodeHandler::new(
            node,
            Arc::clone(&components.coordinator),
            operations,
            Arc::clone(&offload),
        ));

        Ok(LocalNode { offload, handler })
    }
}

fn parse_u64(name: &str, raw: Option<String>) -> Result<Option<u64>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| {
            Error::Config(format!(
                "{name} must be a non-negative integer, got '{raw}': {e}"
            ))
        })
}

/// Parse a boolean flag, accepting `1/0`, `true/false`, `yes/no` and `on/off`
pub(crate) fn parse_bool(name: &str, raw: Option<String>) -> Result<Option<bool>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}
