//! Workflow execution engine
//!
//! The engine module provides the `StepExecutor`, which runs one step at a
//! time against registered handlers, and the `Orchestrator`, which drives a
//! workflow from step to step and hands failures to the saga manager.

mod executor;
mod job;
mod orchestrator;
mod registry;

pub use executor::{ExecutorConfig, ExecutorError, StepExecutor, StepOutcome};
pub use job::StepJob;
pub use orchestrator::{Orchestrator, OrchestratorError, RunOutcome};
pub use registry::{HandlerRegistry, RegistryError};
