//! Component entity merging
//!
//! Permissions are ANDed, statistics summed, children matched by id and
//! merged recursively. Descriptive fields come from the base node.

use super::format::{format_bytes, format_count_and_bytes};
use super::merger::{EntityMerger, NodeEntity};
use super::permissions::Permissions;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A flow component as one node reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentEntity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    /// Descriptive snapshot (name, configuration); hidden without read access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ComponentStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ComponentEntity>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cumulative statistics of a component on one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentStatus {
    pub flow_files_in: u64,
    pub bytes_in: u64,
    pub flow_files_out: u64,
    pub bytes_out: u64,
    pub flow_files_queued: u64,
    pub bytes_queued: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub active_thread_count: u64,
    pub input: String,
    pub output: String,
    pub queued: String,
    pub read: String,
    pub written: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ComponentStatus {
    /// Add another node's counters, saturating at `u64::MAX`. Display
    /// strings are left stale until [`ComponentStatus::refresh_display`].
    pub fn accumulate(&mut self, other: &ComponentStatus) {
        let add = |total: &mut u64, value: u64| *total = total.saturating_add(value);
        add(&mut self.flow_files_in, other.flow_files_in);
        add(&mut self.bytes_in, other.bytes_in);
        add(&mut self.flow_files_out, other.flow_files_out);
        add(&mut self.bytes_out, other.bytes_out);
        add(&mut self.flow_files_queued, other.flow_files_queued);
        add(&mut self.bytes_queued, other.bytes_queued);
        add(&mut self.bytes_read, other.bytes_read);
        add(&mut self.bytes_written, other.bytes_written);
        add(&mut self.active_thread_count, other.active_thread_count);
    }

    pub fn refresh_display(&mut self) {
        self.input = format_count_and_bytes(self.flow_files_in, self.bytes_in);
        self.output = format_count_and_bytes(self.flow_files_out, self.bytes_out);
        self.queued = format_count_and_bytes(self.flow_files_queued, self.bytes_queued);
        self.read = format_bytes(self.bytes_read);
        self.written = format_bytes(self.bytes_written);
    }
}

impl ComponentEntity {
    fn can_read(&self) -> bool {
        self.permissions.map(|p| p.can_read).unwrap_or(true)
    }

    fn redact(&mut self) {
        self.permissions = Some(Permissions::DENIED);
        self.component = None;
    }
}

/// Merge one component as reported by several nodes. `others` holds the
/// same component from every other responding node.
pub fn merge_component(base: &ComponentEntity, others: &[&ComponentEntity]) -> ComponentEntity {
    let mut merged = base.clone();

    merged.permissions = merge_permissions(base, others);
    merged.children = merge_children(base, others);

    let reported: Vec<&ComponentStatus> = std::iter::once(base)
        .chain(others.iter().copied())
        .filter_map(|entity| entity.status.as_ref())
        .collect();
    merged.status = reported.split_first().map(|(first, rest)| {
        let mut total = (*first).clone();
        for status in rest {
            total.accumulate(status);
        }
        total.refresh_display();
        total
    });

    if !merged.can_read() {
        merged.component = None;
    }
    merged
}

fn merge_permissions(
    base: &ComponentEntity,
    others: &[&ComponentEntity],
) -> Option<Permissions> {
    let all = || std::iter::once(base).chain(others.iter().copied());
    if all().all(|entity| entity.permissions.is_none()) {
        return None;
    }
    Some(Permissions::intersect_all(
        all().map(|entity| entity.permissions.unwrap_or(Permissions::DENIED)),
    ))
}

/// Children matched by id: base order first, then children only other nodes
/// reported. A child absent from any responding node is redacted.
fn merge_children(base: &ComponentEntity, others: &[&ComponentEntity]) -> Vec<ComponentEntity> {
    let mut ids: Vec<&str> = base.children.iter().map(|c| c.id.as_str()).collect();
    for other in others {
        for child in &other.children {
            if !ids.contains(&child.id.as_str()) {
                ids.push(child.id.as_str());
            }
        }
    }

    let node_count = others.len() + 1;
    ids.into_iter()
        .filter_map(|id| {
            let copies: Vec<&ComponentEntity> = std::iter::once(base)
                .chain(others.iter().copied())
                .filter_map(|entity| entity.children.iter().find(|child| child.id == id))
                .collect();
            let (first, rest) = copies.split_first()?;
            let mut child = merge_component(first, rest);
            if copies.len() < node_count {
                child.redact();
            }
            Some(child)
        })
        .collect()
}

/// [`EntityMerger`] for process groups, processors, ports and connections
#[derive(Debug, Default)]
pub struct ComponentMerger;

impl EntityMerger for ComponentMerger {
    fn merge(&self, base: NodeEntity<'_>, others: &[NodeEntity<'_>]) -> Result<Value> {
        let base_entity: ComponentEntity = serde_json::from_value(base.entity.clone())?;
        let other_entities = others
            .iter()
            .map(|other| serde_json::from_value::<ComponentEntity>(other.entity.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let refs: Vec<&ComponentEntity> = other_entities.iter().collect();

        Ok(serde_json::to_value(merge_component(&base_entity, &refs))?)
    }
}
