//! Reliability patterns for step execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with jitter between step retries
//! - [`HeartbeatTracker`] - Liveness refresh and timeout detection for in-flight steps
//! - [`TimeoutSweeper`] - Janitor loop failing steps whose heartbeat went silent

mod heartbeat;
mod retry;
mod sweeper;

pub use heartbeat::{HeartbeatGuard, HeartbeatTracker, TimedOutStep};
pub use retry::RetryPolicy;
pub use sweeper::{SweepReport, TimeoutSweeper};
