//! Domain records persisted by the store.
//!
//! Each entity has a row type and a `New*` type for creation, following the
//! tables described in the data model: nodes, edges and DAGs are immutable and
//! content-addressed; workflows, runs, tasks and instances carry a status.

pub mod dag;
pub mod edge;
pub mod identity;
pub mod node;
pub mod task;
pub mod task_instance;
pub mod task_resources;
pub mod workflow;
pub mod workflow_run;

pub use dag::{BoundDag, Dag, NewDag};
pub use edge::{Edge, NewEdge};
pub use node::{NewNode, Node};
pub use task::{NewTask, Task};
pub use task_instance::{InstanceClaim, InstanceUpdate, TaskInstance};
pub use task_resources::{NewTaskResources, ResourceRecordKind, TaskResources};
pub use workflow::{InsertedWorkflow, NewBoundTask, NewWorkflow, NewWorkflowBundle, Workflow};
pub use workflow_run::{NewWorkflowRun, ResumeType, WorkflowRun};
