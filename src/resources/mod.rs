//! # Compute Resources
//!
//! Everything that decides what a task asks the cluster for:
//!
//! - [`request`]: layered resolution (Task, Template, Workflow, Tool) into an
//!   immutable [`ResourceRequest`] at bind time
//! - [`queue`]: the queue catalog and bound validation
//! - [`scaling`]: resource-error retries, with [`ResourceScale`] describing how
//!   each dimension grows and fallback queues taking over when a queue is outgrown

pub mod queue;
pub mod request;
pub mod scaling;

pub use queue::{Queue, QueueCatalog, ResourceBound};
pub use request::{resolve_resources, ResourceLayer, ResourceRequest};
pub use scaling::{
    register_scale_fn, scale_resources, AdjustmentRecord, ResourceScale, ScaleFn, ScaledResources,
};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResourceError {
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("Invalid value {value} for resource '{dimension}'")]
    InvalidValue { dimension: String, value: f64 },

    #[error("Unknown scale function '{0}'")]
    UnknownScaleFn(String),
}
