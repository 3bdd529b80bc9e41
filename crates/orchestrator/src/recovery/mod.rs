//! Workflow recovery after restarts and reconnects

mod manager;

pub use manager::{CancelOutcome, RecoveryError, RecoveryManager};
