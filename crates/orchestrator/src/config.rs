// Orchestrator configuration
//
// Timeouts, retry parameters and the compensation strategy are deployment
// configuration, loaded from environment variables with documented defaults.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use uuid::Uuid;

use crate::engine::ExecutorConfig;
use crate::reliability::RetryPolicy;
use crate::saga::CompensationStrategy;

/// Configuration shared by the orchestration services
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identity used when taking workflow leases
    pub owner_id: String,

    /// How often an in-flight step refreshes its heartbeat
    pub heartbeat_interval: Duration,

    /// Silence after which an in-flight step is considered hung
    pub heartbeat_timeout: Duration,

    /// Recent-activity window for recoverable workflows (stricter than the timeout)
    pub recovery_grace: Duration,

    /// How long a run/resume lease is valid
    pub lease_ttl: Duration,

    /// Default retry budget and backoff for new plans
    pub retry: RetryPolicy,

    /// Optional hard limit on a single handler call
    pub step_deadline: Option<Duration>,

    /// Period of the heartbeat timeout sweep
    pub sweep_interval: Duration,

    /// What to undo when a step fails for good
    pub compensation_strategy: CompensationStrategy,

    /// Postgres connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("orchestrator-{}", Uuid::now_v7()),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(300),
            recovery_grace: Duration::from_secs(120),
            lease_ttl: Duration::from_secs(600),
            retry: RetryPolicy::exponential(),
            step_deadline: None,
            sweep_interval: Duration::from_secs(30),
            compensation_strategy: CompensationStrategy::CompensateAll,
            database_url: None,
        }
    }
}

impl OrchestratorConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SAGAFLOW_OWNER_ID`: Lease owner identity (default: "orchestrator-<uuid>")
    /// - `SAGAFLOW_HEARTBEAT_INTERVAL_SECS`: Heartbeat refresh period (default: 10)
    /// - `SAGAFLOW_HEARTBEAT_TIMEOUT_SECS`: Hung-step threshold (default: 300)
    /// - `SAGAFLOW_RECOVERY_GRACE_SECS`: Recoverable-workflow window (default: 120)
    /// - `SAGAFLOW_LEASE_TTL_SECS`: Lease validity (default: 600)
    /// - `SAGAFLOW_MAX_RETRIES`: Default retries per step (default: 3)
    /// - `SAGAFLOW_RETRY_INITIAL_MS`: First backoff delay (default: 1000)
    /// - `SAGAFLOW_RETRY_MAX_MS`: Backoff cap (default: 60000)
    /// - `SAGAFLOW_RETRY_BACKOFF`: Backoff multiplier (default: 2.0)
    /// - `SAGAFLOW_RETRY_JITTER`: Jitter fraction (default: 0.1)
    /// - `SAGAFLOW_STEP_DEADLINE_SECS`: Per-call handler deadline (default: none)
    /// - `SAGAFLOW_SWEEP_INTERVAL_SECS`: Timeout sweep period (default: 30)
    /// - `SAGAFLOW_COMPENSATION_STRATEGY`: `compensate_all` | `manual` | `compensate_from:<n>`
    /// - `DATABASE_URL`: Postgres connection string (default: in-memory store)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_retries: env_parse("SAGAFLOW_MAX_RETRIES")?.unwrap_or(defaults.retry.max_retries),
            initial_interval: env_millis("SAGAFLOW_RETRY_INITIAL_MS")?
                .unwrap_or(defaults.retry.initial_interval),
            max_interval: env_millis("SAGAFLOW_RETRY_MAX_MS")?
                .unwrap_or(defaults.retry.max_interval),
            backoff_coefficient: env_parse("SAGAFLOW_RETRY_BACKOFF")?
                .unwrap_or(defaults.retry.backoff_coefficient),
            jitter: env_parse("SAGAFLOW_RETRY_JITTER")?.unwrap_or(defaults.retry.jitter),
        };

        let config = Self {
            owner_id: env::var("SAGAFLOW_OWNER_ID").unwrap_or(defaults.owner_id),
            heartbeat_interval: env_secs("SAGAFLOW_HEARTBEAT_INTERVAL_SECS")?
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_timeout: env_secs("SAGAFLOW_HEARTBEAT_TIMEOUT_SECS")?
                .unwrap_or(defaults.heartbeat_timeout),
            recovery_grace: env_secs("SAGAFLOW_RECOVERY_GRACE_SECS")?
                .unwrap_or(defaults.recovery_grace),
            lease_ttl: env_secs("SAGAFLOW_LEASE_TTL_SECS")?.unwrap_or(defaults.lease_ttl),
            retry,
            step_deadline: env_secs("SAGAFLOW_STEP_DEADLINE_SECS")?,
            sweep_interval: env_secs("SAGAFLOW_SWEEP_INTERVAL_SECS")?
                .unwrap_or(defaults.sweep_interval),
            compensation_strategy: env_parse("SAGAFLOW_COMPENSATION_STRATEGY")?
                .unwrap_or(defaults.compensation_strategy),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("heartbeat interval must be positive"));
        }
        if self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(anyhow!(
                "heartbeat interval ({:?}) must be shorter than the heartbeat timeout ({:?})",
                self.heartbeat_interval,
                self.heartbeat_timeout
            ));
        }
        if self.retry.backoff_coefficient < 1.0 {
            return Err(anyhow!("retry backoff must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(anyhow!("retry jitter must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_recovery_grace(mut self, grace: Duration) -> Self {
        self.recovery_grace = grace;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_step_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.step_deadline = deadline;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_compensation_strategy(mut self, strategy: CompensationStrategy) -> Self {
        self.compensation_strategy = strategy;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Step executor settings derived from this configuration
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_retry_policy(self.retry.clone())
            .with_step_deadline(self.step_deadline)
    }
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: {:?}", name, value)),
        _ => Ok(None),
    }
}

fn env_secs(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

fn env_millis(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.recovery_grace < config.heartbeat_timeout);
        assert!(config.owner_id.starts_with("orchestrator-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_executor_config() {
        let config = OrchestratorConfig::default()
            .with_heartbeat_interval(Duration::from_secs(2))
            .with_step_deadline(Some(Duration::from_secs(30)));

        let executor = config.executor_config();
        assert_eq!(executor.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(executor.step_deadline, Some(Duration::from_secs(30)));
        assert_eq!(executor.retry_policy.max_retries, 3);
    }

    #[test]
    fn test_validate_rejects_interval_above_timeout() {
        let config = OrchestratorConfig::default()
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_heartbeat_timeout(Duration::from_secs(30));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env_reads_variables() {
        // Variable names are unique to this test
        env::set_var("SAGAFLOW_HEARTBEAT_TIMEOUT_SECS", "120");
        env::set_var("SAGAFLOW_COMPENSATION_STRATEGY", "manual");
        env::set_var("SAGAFLOW_OWNER_ID", "worker-a");

        let config = OrchestratorConfig::from_env().unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(config.compensation_strategy, CompensationStrategy::Manual);
        assert_eq!(config.owner_id, "worker-a");

        env::set_var("SAGAFLOW_HEARTBEAT_TIMEOUT_SECS", "soon");
        assert!(OrchestratorConfig::from_env().is_err());

        env::remove_var("SAGAFLOW_HEARTBEAT_TIMEOUT_SECS");
        env::remove_var("SAGAFLOW_COMPENSATION_STRATEGY");
        env::remove_var("SAGAFLOW_OWNER_ID");
    }
}
