use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ResourceError;
use crate::config::ResourcesConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBound {
    pub min: f64,
    pub max: f64,
}

impl ResourceBound {
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// A cluster queue and the per-dimension bounds it accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub bounds: BTreeMap<String, ResourceBound>,
}

impl Queue {
    pub fn bound(&self, dimension: &str) -> Option<&ResourceBound> {
        self.bounds.get(dimension)
    }

    /// True when any value is above the queue maximum for its dimension
    pub fn is_exceeded_by(&self, values: &BTreeMap<String, f64>) -> bool {
        values.iter().any(|(dimension, value)| {
            self.bound(dimension)
                .map(|bound| *value > bound.max)
                .unwrap_or(false)
        })
    }

    /// Clamp every bounded dimension; unbounded dimensions pass through
    pub fn clamp(&self, values: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        values
            .iter()
            .map(|(dimension, value)| {
                let clamped = self
                    .bound(dimension)
                    .map(|bound| bound.clamp(*value))
                    .unwrap_or(*value);
                (dimension.clone(), clamped)
            })
            .collect()
    }
}

/// Queues known to the cluster, by name
#[derive(Debug, Clone, Default)]
pub struct QueueCatalog {
    queues: HashMap<String, Queue>,
}

impl QueueCatalog {
    pub fn new(queues: impl IntoIterator<Item = Queue>) -> Self {
        Self {
            queues: queues
                .into_iter()
                .map(|queue| (queue.name.clone(), queue))
                .collect(),
        }
    }

    pub fn from_config(config: &ResourcesConfig) -> Self {
        Self::new(config.queues.iter().map(|queue| Queue {
            name: queue.name.clone(),
            bounds: queue
                .bounds
                .iter()
                .map(|(dimension, bound)| {
                    (
                        dimension.clone(),
                        ResourceBound {
                            min: bound.min,
                            max: bound.max,
                        },
                    )
                })
                .collect(),
        }))
    }

    pub fn get(&self, name: &str) -> Result<&Queue, ResourceError> {
        self.queues
            .get(name)
            .ok_or_else(|| ResourceError::UnknownQueue(name.to_string()))
    }

    /// Validate requested values against a queue, clamping out-of-bound values
    pub fn validate(
        &self,
        queue_name: &str,
        values: &BTreeMap<String, f64>,
    ) -> Result<BTreeMap<String, f64>, ResourceError> {
        for (dimension, value) in values {
            if !value.is_finite() || *value < 0.0 {
                return Err(ResourceError::InvalidValue {
                    dimension: dimension.clone(),
                    value: *value,
                });
            }
        }

        let queue = self.get(queue_name)?;
        let clamped = queue.clamp(values);
        for (dimension, value) in &clamped {
            if values.get(dimension) != Some(value) {
                debug!(
                    queue = queue_name,
                    dimension = %dimension,
                    requested = values.get(dimension).copied(),
                    validated = value,
                    "Resource value clamped to queue bounds"
                );
            }
        }
        Ok(clamped)
    }
}
