use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::resources::AdjustmentRecord;

/// Which stage of the resource history a row records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRecordKind {
    /// Values as requested by the resolved layers
    Original,
    /// Values clamped to the queue bounds
    Validated,
    /// Values scaled after a resource kill
    Adjusted,
}

impl fmt::Display for ResourceRecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original => write!(f, "original"),
            Self::Validated => write!(f, "validated"),
            Self::Adjusted => write!(f, "adjusted"),
        }
    }
}

impl std::str::FromStr for ResourceRecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(Self::Original),
            "validated" => Ok(Self::Validated),
            "adjusted" => Ok(Self::Adjusted),
            _ => Err(format!("Invalid resource record kind: {s}")),
        }
    }
}

/// TaskResources is one append-only row of a task's resource history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResources {
    pub task_resources_id: i64,
    pub task_id: i64,
    pub kind: ResourceRecordKind,
    pub queue: String,
    pub values: BTreeMap<String, f64>,
    pub adjustments: Vec<AdjustmentRecord>,
    pub created_at: DateTime<Utc>,
}

impl TaskResources {
    pub fn value(&self, dimension: &str) -> Option<f64> {
        self.values.get(dimension).copied()
    }

    /// Stable signature of queue and values, used to batch identical requests together
    pub fn signature(&self) -> String {
        let values: Vec<String> = self
            .values
            .iter()
            .map(|(dimension, value)| format!("{dimension}={value}"))
            .collect();
        format!("{}[{}]", self.queue, values.join(","))
    }
}

/// New TaskResources row for creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskResources {
    pub task_id: i64,
    pub kind: ResourceRecordKind,
    pub queue: String,
    pub values: BTreeMap<String, f64>,
    pub adjustments: Vec<AdjustmentRecord>,
}
