//! Workflow model
//!
//! Blueprints (`Workflow`, `Step`), the dependency graph, the immutable
//! context passed between steps, and the result envelopes. Execution
//! lives in the engine crate.

pub mod context;
pub mod definition;
pub mod graph;
pub mod result;
pub mod step;

pub use context::WorkflowContext;
pub use definition::{ExecutionMode, Workflow};
pub use graph::{topological_order, validate_steps, WorkflowBuildError};
pub use result::{
    StepDisposition, StepOutcome, StepQuality, StepRecord, StepResult, WorkflowResult,
    WorkflowStatus,
};
pub use step::{ErrorPolicy, Step, StepKind};
