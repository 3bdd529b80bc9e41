//! Persistence layer for workflow documents
//!
//! This module provides:
//! - [`WorkflowStore`] trait for document CRUD, leases and the audit log
//! - [`InMemoryWorkflowStore`] for testing and single-process use
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{StoreError, WorkflowStore};
