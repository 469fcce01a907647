//! Node-side offload handling
//!
//! When a node is told to offload, it waits for the dataflow engine to report
//! that local processing has stopped and then tells the coordinator that the
//! node is OFFLOADED. The engine itself is never driven from here; only its
//! "processing active" signal is consumed.

use super::connection::NodeConnectionState;
use super::coordinator::{ClusterCoordinator, Heartbeat};
use super::node::NodeIdentifier;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Signal from the dataflow engine
#[async_trait]
pub trait ProcessingSignal: Send + Sync {
    /// Whether local work is currently scheduled or running
    async fn is_processing_active(&self) -> bool;
}

/// [`ProcessingSignal`] backed by a flag the engine flips
#[derive(Debug, Default)]
pub struct AtomicProcessingSignal {
    active: AtomicBool,
}

impl AtomicProcessingSignal {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessingSignal for AtomicProcessingSignal {
    async fn is_processing_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Where a node sends its heartbeats
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<()>;
}

#[async_trait]
impl HeartbeatSink for ClusterCoordinator {
    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.handle_heartbeat(heartbeat).map(|_| ())
    }
}

/// Runs at most one offload wait at a time for the local node
pub struct OffloadAgent {
    node: NodeIdentifier,
    engine: Arc<dyn ProcessingSignal>,
    heartbeats: Arc<dyn HeartbeatSink>,
    poll_interval: Duration,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl OffloadAgent {
    pub fn new(
        node: NodeIdentifier,
        engine: Arc<dyn ProcessingSignal>,
        heartbeats: Arc<dyn HeartbeatSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            node,
            engine,
            heartbeats,
            poll_interval,
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start waiting for the engine to go idle.
    ///
    /// Returns `false` if an offload is already in progress. Fails once the
    /// agent has been shut down, since the wait could never report OFFLOADED.
    pub fn start_offload(self: &Arc<Self>) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(Error::IllegalState(format!(
                "offload agent for node {} has been shut down",
                self.node.id()
            )));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(node_id = %self.node.id(), "Offload already in progress");
            return Ok(false);
        }

        info!(node_id = %self.node.id(), "Starting offload of local node");
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.run().await;
            agent.running.store(false, Ordering::SeqCst);
        });
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop any in-flight offload wait
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(&self) {
        loop {
            if !self.engine.is_processing_active().await {
                break;
            }
            debug!(node_id = %self.node.id(), "Waiting for local processing to stop");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(node_id = %self.node.id(), "Offload interrupted");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        let heartbeat = Heartbeat::new(self.node.clone(), NodeConnectionState::Offloaded);
        match self.heartbeats.send_heartbeat(heartbeat).await {
            Ok(()) => info!(node_id = %self.node.id(), "Local node finished offloading"),
            Err(e) => warn!(
                node_id = %self.node.id(),
                "Failed to report offload completion, the next heartbeat will retry: {}",
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::connection::OffloadCode;
    use crate::cluster::node_registry::NodeRegistry;
    use crate::cluster::ClusterConfig;

    fn offloading_coordinator(node: &NodeIdentifier) -> Arc<ClusterCoordinator> {
        let coordinator = Arc::new(ClusterCoordinator::new(
            Arc::new(NodeRegistry::new()),
            ClusterConfig::default(),
        ));
        coordinator
            .handle_heartbeat(Heartbeat::new(node.clone(), NodeConnectionState::Connecting))
            .unwrap();
        coordinator
            .begin_offload(node.id(), OffloadCode::Offloaded, "test")
            .unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_reports_offloaded_once_engine_idles() {
        let node = NodeIdentifier::new("node1", "localhost", 8080);
        let coordinator = offloading_coordinator(&node);
        let engine = Arc::new(AtomicProcessingSignal::new(true));
        let agent = Arc::new(OffloadAgent::new(
            node.clone(),
            engine.clone(),
            coordinator.clone(),
            Duration::from_millis(5),
        ));

        assert!(agent.start_offload().unwrap());
        assert!(!agent.start_offload().unwrap(), "second start must be a no-op");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            coordinator.get_status("node1").unwrap().state,
            NodeConnectionState::Offloading
        );

        engine.set_active(false);
        for _ in 0..100 {
            if !agent.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(
            coordinator.get_status("node1").unwrap().state,
            NodeConnectionState::Offloaded
        );
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let node = NodeIdentifier::new("node1", "localhost", 8080);
        let coordinator = offloading_coordinator(&node);
        let agent = Arc::new(OffloadAgent::new(
            node,
            Arc::new(AtomicProcessingSignal::new(true)),
            coordinator.clone(),
            Duration::from_millis(5),
        ));

        agent.start_offload().unwrap();
        agent.shutdown();
        for _ in 0..100 {
            if !agent.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!agent.is_running());
        assert_eq!(
            coordinator.get_status("node1").unwrap().state,
            NodeConnectionState::Offloading
        );
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_refused() {
        let node = NodeIdentifier::new("node1", "localhost", 8080);
        let coordinator = offloading_coordinator(&node);
        let agent = Arc::new(OffloadAgent::new(
            node,
            Arc::new(AtomicProcessingSignal::new(false)),
            coordinator.clone(),
            Duration::from_millis(5),
        ));

        agent.shutdown();
        assert!(matches!(agent.start_offload(), Err(Error::IllegalState(_))));
        assert!(!agent.is_running());
        assert_eq!(
            coordinator.get_status("node1").unwrap().state,
            NodeConnectionState::Offloading
        );
    }
}
