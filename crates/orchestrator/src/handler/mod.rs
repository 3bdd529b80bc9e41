//! Step handler abstractions
//!
//! Handlers are the pluggable business implementations of action types.
//! They:
//! - Receive the step and a read-only view of earlier step results
//! - Report failure as a value, optionally marked non-retryable
//! - May suspend the workflow to wait for user input

mod context;
mod definition;

pub use context::StepContext;
pub use definition::{
    ExecutionResult, FnStepHandler, StepError, StepErrorKind, StepHandler, StepInvocation,
};
