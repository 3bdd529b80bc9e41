//! Workflow data model
//!
//! This module contains the persisted document and its parts:
//! - [`Workflow`] aggregate root and its [`WorkflowBuilder`]
//! - [`Step`] planned units of work and their [`StepPlan`]
//! - [`CompensationAction`] undo operations and the compensation history
//! - Status enums with exhaustive transition tables
//! - [`WorkflowEventRecord`] audit log entries

mod compensation;
mod definition;
mod event;
mod status;
mod step;

pub use compensation::{CompensationAction, CompensationRecord};
pub use definition::{
    AwaitingInput, Lease, PlanError, StepResults, Workflow, WorkflowBuilder, WorkflowError,
    DEFAULT_TASK_TYPE,
};
pub use event::{Actor, EventType, WorkflowEventRecord};
pub use status::{
    CompensationStatus, InvalidStatusTransition, RollbackOutcome, StepStatus, WorkflowStatus,
};
pub use step::{action_types, is_valid_key, ActionType, CompensationSpec, Step, StepPlan};
