use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::scaling::ResourceScale;
use crate::config::ResourcesConfig;
use crate::constants::resource_keys;

/// One layer of resource settings. Unset fields defer to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLayer {
    pub queue: Option<String>,
    pub values: BTreeMap<String, f64>,
    pub fallback_queues: Option<Vec<String>>,
    pub scales: BTreeMap<String, ResourceScale>,
}

impl ResourceLayer {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_value(mut self, dimension: impl Into<String>, value: f64) -> Self {
        self.values.insert(dimension.into(), value);
        self
    }

    pub fn with_fallback_queues(mut self, queues: Vec<String>) -> Self {
        self.fallback_queues = Some(queues);
        self
    }

    pub fn with_scale(mut self, dimension: impl Into<String>, scale: ResourceScale) -> Self {
        self.scales.insert(dimension.into(), scale);
        self
    }
}

/// Fully resolved request attached to a task at bind time and never re-resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub queue: String,
    pub values: BTreeMap<String, f64>,
    pub fallback_queues: Vec<String>,
    pub scales: BTreeMap<String, ResourceScale>,
}

/// Resolve layers into one request.
///
/// `layers` runs from highest precedence (task) to lowest (workflow); the tool
/// defaults from configuration sit underneath all of them. Values and scales
/// merge per dimension; queue and fallback list take the first layer that sets them.
pub fn resolve_resources(layers: &[&ResourceLayer], tool: &ResourcesConfig) -> ResourceRequest {
    let queue = layers
        .iter()
        .find_map(|layer| layer.queue.clone())
        .unwrap_or_else(|| tool.default_queue.clone());

    let fallback_queues = layers
        .iter()
        .find_map(|layer| layer.fallback_queues.clone())
        .unwrap_or_default();

    let mut values = tool.tool_defaults.clone();
    let mut scales: BTreeMap<String, ResourceScale> = resource_keys::DEFAULT_SCALED
        .iter()
        .map(|dimension| {
            (
                dimension.to_string(),
                ResourceScale::Multiplicative(tool.default_scale_factor),
            )
        })
        .collect();

    for layer in layers.iter().rev() {
        values.extend(layer.values.iter().map(|(k, v)| (k.clone(), *v)));
        scales.extend(layer.scales.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    ResourceRequest {
        queue,
        values,
        fallback_queues,
        scales,
    }
}
