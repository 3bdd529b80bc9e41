//! Step liveness tracking
//!
//! While a step is in flight, a background task refreshes the workflow's
//! `last_heartbeat` through the store. Detection is independent of the
//! refresh: it compares "now - last heartbeat" in the store against a
//! threshold, so a crashed process is caught by any other process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::persistence::{StoreError, WorkflowStore};
use crate::workflow::{Workflow, WorkflowStatus};

/// A workflow whose in-flight step has gone silent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedOutStep {
    pub workflow_id: Uuid,
    pub session_id: String,
    pub step_id: u32,

    /// Last sign of life seen in the store
    pub last_seen: DateTime<Utc>,

    /// How long the step had been silent when detected
    #[serde(with = "duration_secs")]
    pub silence: Duration,
}

struct ActiveHeartbeat {
    step_id: u32,
    started_at: DateTime<Utc>,
    token: CancellationToken,
}

/// Tracks the single in-flight step of each workflow
///
/// Must be used from within a tokio runtime: [`start`](Self::start)
/// spawns the refresh task.
pub struct HeartbeatTracker {
    store: Arc<dyn WorkflowStore>,
    active: DashMap<Uuid, ActiveHeartbeat>,
}

impl HeartbeatTracker {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            active: DashMap::new(),
        }
    }

    /// Begin refreshing the heartbeat every `interval`
    ///
    /// The first refresh happens immediately. Starting a heartbeat for a
    /// workflow that already has one replaces it.
    pub fn start(&self, workflow_id: Uuid, step_id: u32, interval: Duration) {
        let token = CancellationToken::new();
        let previous = self.active.insert(
            workflow_id,
            ActiveHeartbeat {
                step_id,
                started_at: Utc::now(),
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(%workflow_id, replaced_step = previous.step_id, step_id, "replacing heartbeat");
            previous.token.cancel();
        }

        let store = self.store.clone();
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.update_heartbeat(workflow_id).await {
                            Ok(_) => {}
                            Err(StoreError::WorkflowNotFound(_)) => {
                                warn!(%workflow_id, step_id, "workflow gone, stopping heartbeat");
                                break;
                            }
                            Err(e) => warn!(%workflow_id, step_id, error = %e, "heartbeat refresh failed"),
                        }
                    }
                }
            }
        });

        debug!(%workflow_id, step_id, ?interval, "heartbeat started");
    }

    /// Start a heartbeat that stops when the returned guard is dropped
    pub fn start_guarded(
        &self,
        workflow_id: Uuid,
        step_id: u32,
        interval: Duration,
    ) -> HeartbeatGuard<'_> {
        self.start(workflow_id, step_id, interval);
        HeartbeatGuard {
            tracker: self,
            workflow_id,
            step_id,
        }
    }

    /// Stop tracking a workflow; returns whether a heartbeat was active
    pub fn stop(&self, workflow_id: Uuid) -> bool {
        match self.active.remove(&workflow_id) {
            Some((_, active)) => {
                active.token.cancel();
                debug!(%workflow_id, step_id = active.step_id, "heartbeat stopped");
                true
            }
            None => false,
        }
    }

    /// Stop only if `step_id` is still the tracked step
    fn stop_step(&self, workflow_id: Uuid, step_id: u32) {
        let removed = self
            .active
            .remove_if(&workflow_id, |_, active| active.step_id == step_id);
        if let Some((_, active)) = removed {
            active.token.cancel();
            debug!(%workflow_id, step_id, "heartbeat stopped");
        }
    }

    /// Step currently tracked for a workflow
    pub fn active_step(&self, workflow_id: Uuid) -> Option<u32> {
        self.active.get(&workflow_id).map(|a| a.step_id)
    }

    /// When the current heartbeat for a workflow was started
    pub fn active_since(&self, workflow_id: Uuid) -> Option<DateTime<Utc>> {
        self.active.get(&workflow_id).map(|a| a.started_at)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Stop every heartbeat (shutdown)
    pub fn stop_all(&self) {
        for entry in self.active.iter() {
            entry.token.cancel();
        }
        self.active.clear();
    }

    /// Check one workflow; does not change workflow state
    pub async fn check_timeout(
        &self,
        workflow_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<TimedOutStep>, StoreError> {
        let workflow = self.store.get(workflow_id).await?;
        Ok(timed_out_step(&workflow, timeout, Utc::now()))
    }

    /// Check every running workflow; does not change workflow state
    pub async fn check_all_timed_out(
        &self,
        timeout: Duration,
    ) -> Result<Vec<TimedOutStep>, StoreError> {
        let now = Utc::now();
        let running = self.store.list_by_status(WorkflowStatus::Running).await?;
        Ok(running
            .iter()
            .filter_map(|w| timed_out_step(w, timeout, now))
            .collect())
    }
}

impl Drop for HeartbeatTracker {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Stops its heartbeat on every exit path of step execution
pub struct HeartbeatGuard<'a> {
    tracker: &'a HeartbeatTracker,
    workflow_id: Uuid,
    step_id: u32,
}

impl Drop for HeartbeatGuard<'_> {
    fn drop(&mut self) {
        self.tracker.stop_step(self.workflow_id, self.step_id);
    }
}

fn timed_out_step(workflow: &Workflow, timeout: Duration, now: DateTime<Utc>) -> Option<TimedOutStep> {
    if workflow.status != WorkflowStatus::Running {
        return None;
    }

    let step = workflow.steps.iter().find(|s| s.status.is_in_flight())?;
    let silence = workflow.silence(now);
    if silence <= timeout {
        return None;
    }

    Some(TimedOutStep {
        workflow_id: workflow.workflow_id,
        session_id: workflow.session_id.clone(),
        step_id: step.step_id,
        last_seen: workflow.last_seen(),
        silence,
    })
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
