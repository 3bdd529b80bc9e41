//! Randomised plans checked against the data-model invariants
//!
//! Run with: cargo test -p sagaflow-orchestrator --test workflow_invariants

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use sagaflow_orchestrator::prelude::*;
use sagaflow_orchestrator::{RollbackOutcome, SagaError};

const OK: &str = "ok";
const FLAKY: &str = "flaky";
const BROKEN: &str = "broken";

fn services(store: &Arc<InMemoryWorkflowStore>) -> WorkflowServices {
    let config = OrchestratorConfig::default()
        .with_owner_id("prop")
        .with_retry(RetryPolicy::fixed(Duration::ZERO, 2))
        .with_heartbeat_interval(Duration::from_millis(10));
    let services = WorkflowServices::new(store.clone(), config);

    // Behaviour is chosen by the step description
    services
        .executor
        .register_fn(action_types::COMPUTATION, |inv: StepInvocation| async move {
            match inv.step.description.as_str() {
                FLAKY if inv.ctx.attempt < 2 => {
                    ExecutionResult::failure(StepError::retryable("transient"))
                }
                BROKEN => ExecutionResult::failure(StepError::non_retryable("broken step")),
                _ => ExecutionResult::success(json!({ "response": format!("step {}", inv.step.step_id) })),
            }
        })
        .unwrap();
    services
        .saga
        .register_fn("undo", |_action, _ctx| async { CompensationOutcome::executed() })
        .unwrap();
    services
        .saga
        .register_fn("undo_broken", |_action, _ctx| async {
            CompensationOutcome::failed("undo endpoint unavailable")
        })
        .unwrap();
    services
}

struct Planned {
    behaviour: &'static str,
    compensation: Option<&'static str>,
}

fn random_plan(rng: &mut StdRng) -> Vec<Planned> {
    let len = rng.gen_range(1..=6);
    (0..len)
        .map(|_| Planned {
            behaviour: match rng.gen_range(0..10) {
                0 | 1 => BROKEN,
                2 | 3 => FLAKY,
                _ => OK,
            },
            compensation: match rng.gen_range(0..4) {
                0 => None,
                1 => Some("undo_broken"),
                _ => Some("undo"),
            },
        })
        .collect()
}

fn check_document(wf: &Workflow) {
    wf.check_invariants().unwrap();

    let domain = 1..=wf.steps.len() as u32;
    for step_id in &wf.completed_steps {
        assert!(domain.contains(step_id));
        assert!(!wf.failed_steps.contains(step_id));
    }
    for step_id in &wf.failed_steps {
        assert!(domain.contains(step_id));
    }
    for record in &wf.compensation_history {
        assert!(wf.completed_steps.contains(&record.step_id));
    }
}

#[tokio::test]
async fn test_random_plans_keep_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5a6a);

    for _ in 0..40 {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let services = services(&store);
        let plan = random_plan(&mut rng);

        let mut builder = services.orchestrator.plan("prop", "random plan");
        for (i, planned) in plan.iter().enumerate() {
            let mut step = StepPlan::new(action_types::COMPUTATION, planned.behaviour, format!("step {}", i + 1));
            if let Some(compensation) = planned.compensation {
                step = step.with_compensation(compensation, json!({}));
            }
            builder = builder.step(step);
        }
        let wf = services.orchestrator.submit(builder.build().unwrap()).await.unwrap();

        let outcome = services.orchestrator.run(wf.workflow_id).await.unwrap();
        let stored = store.get(wf.workflow_id).await.unwrap();
        check_document(&stored);
        assert!(stored.is_terminal());
        assert!(stored.lease.is_none());

        let first_broken = plan.iter().position(|p| p.behaviour == BROKEN);
        match first_broken {
            None => {
                assert!(matches!(outcome, RunOutcome::Completed { .. }));
                assert_eq!(stored.status, WorkflowStatus::Completed);
                let all: Vec<u32> = (1..=plan.len() as u32).collect();
                assert_eq!(stored.completed_steps, all);
                assert!(stored.compensation_history.is_empty());
            }
            Some(index) => {
                let failed_step = index as u32 + 1;
                let completed: Vec<u32> = (1..failed_step).collect();
                assert_eq!(stored.completed_steps, completed);
                assert_eq!(stored.failed_steps, vec![failed_step]);
                assert_eq!(stored.status, WorkflowStatus::Cancelled);

                // Reverse completion order, only steps that declared a compensation
                let expected: Vec<u32> = completed
                    .iter()
                    .rev()
                    .copied()
                    .filter(|id| plan[*id as usize - 1].compensation.is_some())
                    .collect();
                let history: Vec<u32> =
                    stored.compensation_history.iter().map(|r| r.step_id).collect();
                assert_eq!(history, expected);

                let any_broken_undo = completed
                    .iter()
                    .any(|id| plan[*id as usize - 1].compensation == Some("undo_broken"));
                let expected_rollback = if any_broken_undo {
                    RollbackOutcome::PartiallyCompensated
                } else {
                    RollbackOutcome::FullyCompensated
                };
                assert_eq!(stored.rollback, Some(expected_rollback));

                let RunOutcome::RolledBack { step_id, report, .. } = outcome else {
                    panic!("expected rollback, got {:?}", outcome);
                };
                assert_eq!(step_id, failed_step);
                assert_eq!(report.attempted(), expected.len());
            }
        }
    }
}

#[tokio::test]
async fn test_current_step_never_decreases_during_a_run() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let services = services(&store);

    let wf = services
        .orchestrator
        .plan("prop", "monotonic")
        .steps((1..=4).map(|i| StepPlan::new(action_types::COMPUTATION, FLAKY, format!("step {}", i))))
        .build()
        .unwrap();
    let wf = services.orchestrator.submit(wf).await.unwrap();
    let workflow_id = wf.workflow_id;

    let orchestrator = services.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.run(workflow_id).await });

    let mut observed = Vec::new();
    while !run.is_finished() {
        observed.push(store.get(workflow_id).await.unwrap().current_step);
        tokio::task::yield_now().await;
    }
    run.await.unwrap().unwrap();
    observed.push(store.get(workflow_id).await.unwrap().current_step);

    assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(observed.last(), Some(&5));
}

#[tokio::test]
async fn test_terminal_workflow_cannot_be_mutated() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let services = services(&store);

    let wf = services
        .orchestrator
        .plan("prop", "done")
        .step(StepPlan::new(action_types::COMPUTATION, OK, "only").with_compensation("undo", json!({})))
        .build()
        .unwrap();
    let wf = services.orchestrator.submit(wf).await.unwrap();
    services.orchestrator.run(wf.workflow_id).await.unwrap();

    let mut done = store.get(wf.workflow_id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);

    let saga = services.saga.compensate_all(&mut done, "late").await;
    assert!(matches!(saga, Err(SagaError::Terminal { .. })));

    done.final_response = Some("rewritten".into());
    let write = store.update(&mut done, vec![]).await;
    assert!(matches!(write, Err(StoreError::Terminal(_))));

    let cancel = services.recovery.cancel(wf.workflow_id, true).await;
    assert!(matches!(cancel, Err(RecoveryError::InvalidStatusTransition(_))));

    let stored = store.get(wf.workflow_id).await.unwrap();
    assert_eq!(stored.final_response.as_deref(), Some("step 1"));
    assert!(stored.compensation_history.is_empty());
}
