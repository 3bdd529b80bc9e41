//! Heartbeat timeout sweeper
//!
//! Janitor loop that periodically looks for RUNNING workflows whose
//! in-flight step has gone silent and moves them into the failure path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::heartbeat::HeartbeatTracker;
use crate::engine::{Orchestrator, OrchestratorError};
use crate::persistence::StoreError;

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Timed-out steps found
    pub detected: usize,

    /// Workflows moved to the failure path
    pub failed: usize,

    /// Workflows that moved on before they could be failed
    pub skipped: usize,

    /// Lost write races (retried on the next sweep)
    pub conflicts: usize,

    pub errors: usize,
}

/// Periodic timeout detection
pub struct TimeoutSweeper {
    heartbeats: Arc<HeartbeatTracker>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    timeout: Duration,
}

impl TimeoutSweeper {
    pub fn new(
        heartbeats: Arc<HeartbeatTracker>,
        orchestrator: Arc<Orchestrator>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            heartbeats,
            orchestrator,
            interval,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Detect and fail every timed-out step once
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let timed_out = self.heartbeats.check_all_timed_out(self.timeout).await?;
        let mut report = SweepReport {
            detected: timed_out.len(),
            ..SweepReport::default()
        };

        for step in &timed_out {
            match self.orchestrator.fail_timed_out(step).await {
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => report.skipped += 1,
                Err(OrchestratorError::Store(e)) if e.is_conflict() => {
                    debug!(workflow_id = %step.workflow_id, error = %e, "timed-out workflow changed concurrently");
                    report.conflicts += 1;
                }
                Err(e) => {
                    error!(workflow_id = %step.workflow_id, step_id = step.step_id, "Failed to fail timed-out step: {}", e);
                    report.errors += 1;
                }
            }
        }

        if report.detected > 0 {
            info!(
                detected = report.detected,
                failed = report.failed,
                conflicts = report.conflicts,
                "Swept timed-out steps"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!("Timeout sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Sweeper: shutdown requested");
                    break;
                }
            }
        }

        debug!("Sweeper loop exited");
    }

    /// Run the loop on a background task
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
