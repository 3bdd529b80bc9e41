//! Saga compensation
//!
//! This module provides:
//! - [`SagaManager`] - Reverse-order compensation sweeps
//! - [`CompensationHandler`] - Pluggable undo logic per compensation type
//! - [`CompensationStrategy`] - Which completed steps to undo on failure

mod handler;
mod manager;
mod strategy;

pub use handler::{
    CompensationContext, CompensationHandler, CompensationOutcome, FnCompensationHandler,
};
pub use manager::{CompensationFailure, CompensationReport, SagaError, SagaManager};
pub use strategy::CompensationStrategy;
