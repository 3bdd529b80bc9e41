// Janitor process
//
// Runs the heartbeat timeout sweeper against the shared workflow store.
// Step and compensation handlers live in the processes that embed the
// orchestrator. With none registered here, a silent step only moves its
// workflow to FAILED; compensations stay pending until a process that has
// the handlers cancels it with force.

use anyhow::{Context, Result};
use sagaflow_orchestrator::telemetry::{init_telemetry, TelemetryConfig};
use sagaflow_orchestrator::{OrchestratorConfig, WorkflowServices};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - SAGAFLOW_SERVICE_NAME: Service name (default: "sagaflow-worker")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "sagaflow_orchestrator=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "sagaflow" {
        telemetry_config.service_name = "sagaflow-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some(
            "sagaflow_orchestrator=info,sagaflow_worker=info".to_string(),
        );
    }
    init_telemetry(telemetry_config)?;

    tracing::info!("sagaflow-worker starting...");

    let config = OrchestratorConfig::from_env().context("Invalid orchestrator configuration")?;

    tracing::info!(
        owner_id = %config.owner_id,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        postgres = config.database_url.is_some(),
        "Starting timeout sweeper"
    );

    let services = WorkflowServices::connect(config)
        .await
        .context("Failed to create workflow services")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = services.sweeper.clone().spawn(shutdown_rx);

    tokio::select! {
        result = sweeper => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Sweeper task failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    }

    services.heartbeats.stop_all();

    tracing::info!("Worker shutdown complete");
    Ok(())
}
