//! Counter listing merging

use super::format::format_count;
use super::merger::{EntityMerger, NodeEntity};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersEntity {
    #[serde(default)]
    pub counters: Vec<CounterEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterEntry {
    pub id: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value_count: u64,
    #[serde(default)]
    pub value: String,
}

/// Sum counters by id across nodes. Counters keep base order; ones only
/// other nodes reported are appended.
pub fn merge_counters(base: &CountersEntity, others: &[&CountersEntity]) -> CountersEntity {
    let mut merged = base.clone();
    for other in others {
        for counter in &other.counters {
            match merged.counters.iter_mut().find(|c| c.id == counter.id) {
                Some(existing) => {
                    existing.value_count = existing.value_count.saturating_add(counter.value_count)
                }
                None => merged.counters.push(counter.clone()),
            }
        }
    }
    for counter in &mut merged.counters {
        counter.value = format_count(counter.value_count);
    }
    merged
}

#[derive(Debug, Default)]
pub struct CountersMerger;

impl EntityMerger for CountersMerger {
    fn merge(&self, base: NodeEntity<'_>, others: &[NodeEntity<'_>]) -> Result<Value> {
        let base_entity: CountersEntity = serde_json::from_value(base.entity.clone())?;
        let other_entities = others
            .iter()
            .map(|other| serde_json::from_value::<CountersEntity>(other.entity.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let refs: Vec<&CountersEntity> = other_entities.iter().collect();

        Ok(serde_json::to_value(merge_counters(&base_entity, &refs))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counters_summed_by_id() {
        let a: CountersEntity = serde_json::from_value(json!({
            "counters": [
                { "id": "c1", "context": "Processor", "name": "records", "valueCount": 1500 },
                { "id": "c2", "context": "Processor", "name": "errors", "valueCount": 1 }
            ],
            "generated": "12:00:00 UTC"
        }))
        .unwrap();
        let b: CountersEntity = serde_json::from_value(json!({
            "counters": [
                { "id": "c1", "context": "Processor", "name": "records", "valueCount": 500 },
                { "id": "c3", "context": "Processor", "name": "retries", "valueCount": 4 }
            ]
        }))
        .unwrap();

        let merged = merge_counters(&a, &[&b]);
        let values: Vec<(&str, u64, &str)> = merged
            .counters
            .iter()
            .map(|c| (c.id.as_str(), c.value_count, c.value.as_str()))
            .collect();
        assert_eq!(
            values,
            vec![("c1", 2000, "2,000"), ("c2", 1, "1"), ("c3", 4, "4")]
        );
        assert_eq!(merged.extra["generated"], "12:00:00 UTC");
    }
}
