//! Merge strategies keyed by resource kind

use super::component::ComponentMerger;
use super::counters::CountersMerger;
use super::permissions;
use crate::cluster::NodeIdentifier;
use crate::replication::ClusterOperation;
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Kind of resource an operation addresses, used to pick a merger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Process groups, processors, ports and connections
    Component,
    /// Counter listings
    Counters,
    /// Anything without a dedicated strategy
    Generic,
}

const COMPONENT_COLLECTIONS: &[&str] = &[
    "process-groups",
    "processors",
    "connections",
    "input-ports",
    "output-ports",
    "remote-process-groups",
];

impl ResourceKind {
    /// Classify an operation by its resource path.
    ///
    /// A leading `flow` segment is ignored, so `/flow/process-groups/root`
    /// and `/process-groups/root` are both components.
    pub fn classify(operation: &ClusterOperation) -> ResourceKind {
        let segments = operation.path_segments();
        let mut segments = segments.iter().copied().peekable();
        if segments.peek() == Some(&"flow") {
            segments.next();
        }

        match segments.next() {
            Some("counters") => ResourceKind::Counters,
            Some(collection) if COMPONENT_COLLECTIONS.contains(&collection) => {
                ResourceKind::Component
            }
            _ => ResourceKind::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Counters => "counters",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node's decoded entity
#[derive(Debug, Clone, Copy)]
pub struct NodeEntity<'a> {
    pub node: &'a NodeIdentifier,
    pub entity: &'a Value,
}

/// Merges the entities several nodes returned for the same operation
pub trait EntityMerger: Send + Sync {
    /// Build the merged entity. `base` supplies every field the strategy
    /// does not aggregate; `others` are the remaining responding nodes.
    fn merge(&self, base: NodeEntity<'_>, others: &[NodeEntity<'_>]) -> Result<Value>;
}

/// Fallback strategy: AND any top-level `permissions` object and take the
/// rest verbatim from the base node.
#[derive(Debug, Default)]
pub struct DefaultMerger;

impl EntityMerger for DefaultMerger {
    fn merge(&self, base: NodeEntity<'_>, others: &[NodeEntity<'_>]) -> Result<Value> {
        let mut merged = base.entity.clone();

        let all = std::iter::once(base.entity).chain(others.iter().map(|other| other.entity));
        if let (Some(permissions), Some(object)) =
            (permissions::intersect_json(all), merged.as_object_mut())
        {
            object.insert("permissions".to_string(), serde_json::to_value(permissions)?);
            if !permissions.can_read {
                object.remove("component");
            }
        }

        Ok(merged)
    }
}

/// Lookup table from resource kind to merge strategy
#[derive(Clone)]
pub struct MergerRegistry {
    mergers: HashMap<ResourceKind, Arc<dyn EntityMerger>>,
    fallback: Arc<dyn EntityMerger>,
}

impl MergerRegistry {
    /// Registry with no dedicated strategies
    pub fn empty() -> Self {
        Self {
            mergers: HashMap::new(),
            fallback: Arc::new(DefaultMerger),
        }
    }

    /// Register (or replace) the strategy for `kind`
    pub fn register(&mut self, kind: ResourceKind, merger: Arc<dyn EntityMerger>) {
        self.mergers.insert(kind, merger);
    }

    /// Strategy for `kind`, or the fallback
    pub fn get(&self, kind: ResourceKind) -> &Arc<dyn EntityMerger> {
        self.mergers.get(&kind).unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &Arc<dyn EntityMerger> {
        &self.fallback
    }
}

impl Default for MergerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(ResourceKind::Component, Arc::new(ComponentMerger));
        registry.register(ResourceKind::Counters, Arc::new(CountersMerger));
        registry
    }
}
