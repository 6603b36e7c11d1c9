//! Resource scaling after a resource-limiter kill.
//!
//! A scale is data rather than a callback so every decision can be persisted
//! and replayed: `Multiplicative` and `Sequence` are plain values and `Custom`
//! refers to a function registered under a stable name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use super::queue::QueueCatalog;
use super::ResourceError;

type ScaleFnPtr = fn(f64) -> f64;

static SCALE_FUNCTIONS: OnceLock<DashMap<String, ScaleFnPtr>> = OnceLock::new();

fn scale_functions() -> &'static DashMap<String, ScaleFnPtr> {
    SCALE_FUNCTIONS.get_or_init(DashMap::new)
}

/// Register a pure scaling function so tasks can reference it by name
pub fn register_scale_fn(name: impl Into<String>, func: ScaleFnPtr) -> ScaleFn {
    let name = name.into();
    scale_functions().insert(name.clone(), func);
    ScaleFn { name, func }
}

/// A named pure function `value -> value`
#[derive(Clone)]
pub struct ScaleFn {
    name: String,
    func: ScaleFnPtr,
}

impl ScaleFn {
    /// Look up a function previously passed to [`register_scale_fn`]
    pub fn named(name: &str) -> Result<Self, ResourceError> {
        scale_functions()
            .get(name)
            .map(|entry| ScaleFn {
                name: name.to_string(),
                func: *entry.value(),
            })
            .ok_or_else(|| ResourceError::UnknownScaleFn(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, value: f64) -> f64 {
        (self.func)(value)
    }
}

impl fmt::Debug for ScaleFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScaleFn").field(&self.name).finish()
    }
}

impl PartialEq for ScaleFn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Serialize for ScaleFn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for ScaleFn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        ScaleFn::named(&name).map_err(serde::de::Error::custom)
    }
}

/// How one resource dimension grows on each resource retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceScale {
    /// `value * (1 + factor)` per retry
    Multiplicative(f64),
    /// Absolute value for retry k is `values[k - 1]`; the last value repeats once exhausted
    Sequence(Vec<f64>),
    Custom(ScaleFn),
}

impl ResourceScale {
    /// `retry` counts resource retries on the current queue, starting at 1
    pub fn apply(&self, current: f64, retry: u32) -> f64 {
        match self {
            Self::Multiplicative(factor) => current * (1.0 + factor),
            Self::Sequence(values) => {
                let index = (retry.max(1) as usize - 1).min(values.len().saturating_sub(1));
                values.get(index).copied().unwrap_or(current)
            }
            Self::Custom(func) => func.call(current),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Multiplicative(factor) => format!("multiplicative({factor})"),
            Self::Sequence(values) => format!("sequence(len={})", values.len()),
            Self::Custom(func) => format!("custom({})", func.name()),
        }
    }
}

/// One scaling decision, stored with the adjusted resource row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub dimension: String,
    pub previous: f64,
    pub scaled: f64,
    /// Value after queue bounds were applied
    pub applied: f64,
    pub scale: String,
    pub retry: u32,
}

/// Output of [`scale_resources`]
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledResources {
    pub queue: String,
    pub values: BTreeMap<String, f64>,
    pub adjustments: Vec<AdjustmentRecord>,
    /// Set when the request outgrew its queue and moved to a fallback queue
    pub moved_from_queue: Option<String>,
}

fn next_fallback<'a>(current: &str, fallback_queues: &'a [String]) -> Option<&'a str> {
    let next = match fallback_queues.iter().position(|queue| queue == current) {
        Some(position) => fallback_queues.get(position + 1),
        None => fallback_queues.first(),
    };
    next.map(String::as_str).filter(|queue| *queue != current)
}

/// Compute the next resource values after a resource kill.
///
/// Every exceeded dimension is scaled independently (every scaled dimension when
/// the cluster did not say which one was exceeded). If any value still exceeds
/// the current queue after scaling and a fallback queue follows it, the request
/// moves to that queue; the values are then clamped to the bounds of the queue
/// they end up on.
pub fn scale_resources(
    current_queue: &str,
    current_values: &BTreeMap<String, f64>,
    scales: &BTreeMap<String, ResourceScale>,
    exceeded: &[String],
    fallback_queues: &[String],
    catalog: &QueueCatalog,
    retry: u32,
) -> Result<ScaledResources, ResourceError> {
    let mut dimensions: Vec<&String> = exceeded
        .iter()
        .filter(|dimension| scales.contains_key(*dimension))
        .collect();
    if dimensions.is_empty() {
        dimensions = scales.keys().collect();
    }

    let mut scaled = current_values.clone();
    let mut adjustments = Vec::new();
    for dimension in dimensions {
        let (Some(previous), Some(scale)) = (current_values.get(dimension), scales.get(dimension))
        else {
            continue;
        };
        let value = scale.apply(*previous, retry);
        scaled.insert(dimension.clone(), value);
        adjustments.push(AdjustmentRecord {
            dimension: dimension.clone(),
            previous: *previous,
            scaled: value,
            applied: value,
            scale: scale.describe(),
            retry,
        });
    }

    let mut queue = catalog.get(current_queue)?;
    let mut moved_from_queue = None;
    if queue.is_exceeded_by(&scaled) {
        if let Some(next) = next_fallback(current_queue, fallback_queues) {
            queue = catalog.get(next)?;
            moved_from_queue = Some(current_queue.to_string());
            debug!(from = current_queue, to = next, "Resource request moved to fallback queue");
        }
    }

    let values = queue.clamp(&scaled);
    for record in &mut adjustments {
        if let Some(applied) = values.get(&record.dimension) {
            record.applied = *applied;
        }
    }

    Ok(ScaledResources {
        queue: queue.name.clone(),
        values,
        adjustments,
        moved_from_queue,
    })
}
